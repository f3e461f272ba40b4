//! Image normalization: decode an upload, straighten it, re-encode as JPEG.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::metadata::{self, ExifPayload};

/// Every normalized image is encoded in this format.
pub const CANONICAL_FORMAT: ImageFormat = ImageFormat::Jpeg;
/// Media type of [`CANONICAL_FORMAT`].
pub const CANONICAL_MEDIA_TYPE: &str = "image/jpeg";
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("uploaded file is empty")]
    Empty,
    #[error("unsupported media type '{0}' (accepted: image/jpeg, image/png, image/heic)")]
    UnsupportedMediaType(String),
    #[error("failed to decode {format} image: {source}")]
    Decode {
        format: &'static str,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to decode HEIF image: {0}")]
    Heif(String),
    #[error("HEIC/HEIF decoding is not available in this build (enable the `heif` feature)")]
    HeifUnavailable,
    #[error("failed to encode JPEG: {0}")]
    Encode(#[source] image::ImageError),
}

/// Source container families accepted at the upload boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Jpeg,
    Png,
    Heif,
}

impl SourceFormat {
    /// Parses a declared media type; parameters and case are ignored.
    pub fn from_media_type(raw: &str) -> Option<Self> {
        let essence = raw
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/heic" | "image/heif" | "image/heic-sequence" | "image/heif-sequence" => {
                Some(Self::Heif)
            }
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "heic" | "heif" | "hif" => Some(Self::Heif),
            _ => None,
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Heif => "image/heic",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Jpeg => "JPEG",
            Self::Png => "PNG",
            Self::Heif => "HEIF",
        }
    }
}

/// Counter-clockwise rotation applied during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Ccw90,
    Ccw180,
    Ccw270,
}

impl Rotation {
    /// Orientation 3, 6 and 8 rotate; mirrored codes and anything else
    /// (including no tag) leave the pixels alone.
    pub fn from_orientation(code: Option<u32>) -> Self {
        match code {
            Some(3) => Self::Ccw180,
            Some(6) => Self::Ccw270,
            Some(8) => Self::Ccw90,
            _ => Self::None,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Ccw90 => 90,
            Self::Ccw180 => 180,
            Self::Ccw270 => 270,
        }
    }

    /// `image` rotates clockwise, so the counter-clockwise turns swap.
    fn apply(self, image: DynamicImage) -> DynamicImage {
        match self {
            Self::None => image,
            Self::Ccw90 => image.rotate270(),
            Self::Ccw180 => image.rotate180(),
            Self::Ccw270 => image.rotate90(),
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// An upload as received: bytes plus the media type the client declared.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    bytes: Vec<u8>,
    media_type: String,
}

impl UploadedImage {
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type: media_type.into(),
        }
    }

    /// Reads an upload from disk. Without an explicit media type it is
    /// inferred from the file extension.
    pub fn from_path(path: &Path, media_type: Option<&str>) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let media_type = media_type
            .map(str::to_string)
            .or_else(|| SourceFormat::from_path(path).map(|format| format.media_type().to_string()))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(Self::new(bytes, media_type))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Embedded EXIF orientation code, if any.
    pub fn orientation(&self) -> Option<u32> {
        metadata::read_exif(&self.bytes).and_then(|payload| payload.orientation)
    }
}

/// Canonical JPEG output of the normalizer. Only [`Normalizer`] builds one,
/// so its media type always matches its encoding.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    rotation: Rotation,
    exif_attached: bool,
}

impl NormalizedImage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn media_type(&self) -> &'static str {
        CANONICAL_MEDIA_TYPE
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn exif_attached(&self) -> bool {
        self.exif_attached
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    jpeg_quality: u8,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Normalizer {
    pub fn with_quality(quality: u8) -> Self {
        Self {
            jpeg_quality: quality.clamp(1, 100),
        }
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    pub fn normalize(&self, upload: &UploadedImage) -> Result<NormalizedImage, NormalizeError> {
        if upload.is_empty() {
            return Err(NormalizeError::Empty);
        }
        let source = SourceFormat::from_media_type(upload.media_type())
            .ok_or_else(|| NormalizeError::UnsupportedMediaType(upload.media_type().to_string()))?;

        let decoded = match source {
            SourceFormat::Heif => heif::decode(upload.bytes())?,
            SourceFormat::Jpeg | SourceFormat::Png => {
                image::load_from_memory(upload.bytes()).map_err(|source_err| {
                    NormalizeError::Decode {
                        format: source.label(),
                        source: source_err,
                    }
                })?
            }
        };

        let exif = metadata::read_exif(upload.bytes());
        // libheif already applies the container's irot/imir transforms.
        let rotation = match source {
            SourceFormat::Heif => Rotation::None,
            SourceFormat::Jpeg | SourceFormat::Png => {
                Rotation::from_orientation(exif.as_ref().and_then(|payload| payload.orientation))
            }
        };
        debug!(
            media_type = upload.media_type(),
            width = decoded.width(),
            height = decoded.height(),
            %rotation,
            "decoded upload"
        );

        let straightened = DynamicImage::ImageRgb8(rotation.apply(decoded).to_rgb8());
        let (width, height) = (straightened.width(), straightened.height());

        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, self.jpeg_quality)
            .encode_image(&straightened)
            .map_err(NormalizeError::Encode)?;

        // HEIF pixels come out of libheif already display-oriented.
        let reoriented = rotation != Rotation::None || source == SourceFormat::Heif;
        let (bytes, exif_attached) = match exif {
            Some(payload) => carry_exif(encoded, payload, reoriented),
            None => (encoded, false),
        };

        Ok(NormalizedImage {
            bytes,
            width,
            height,
            rotation,
            exif_attached,
        })
    }
}

/// Attaches the upload's EXIF block. The orientation tag is reset only when
/// the pixels were re-oriented; mirrored and unknown codes pass through.
fn carry_exif(encoded: Vec<u8>, payload: ExifPayload, reoriented: bool) -> (Vec<u8>, bool) {
    let mut tiff = payload.tiff;
    if reoriented && payload.orientation.is_some_and(|code| code != 1) {
        metadata::reset_orientation(&mut tiff);
    }
    match metadata::attach_exif(&encoded, &tiff) {
        Some(with_exif) => (with_exif, true),
        None => {
            warn!(
                exif_bytes = tiff.len(),
                "EXIF payload does not fit a single APP1 segment; dropping it"
            );
            (encoded, false)
        }
    }
}

#[cfg(feature = "heif")]
mod heif {
    use image::{DynamicImage, RgbImage};
    use libheif_rs::{ColorSpace, HeifContext, LibHeif, RgbChroma};

    use super::NormalizeError;

    pub(super) fn decode(bytes: &[u8]) -> Result<DynamicImage, NormalizeError> {
        let lib_heif = LibHeif::new();
        let ctx = HeifContext::read_from_bytes(bytes)
            .map_err(|err| NormalizeError::Heif(format!("failed to read container: {err}")))?;
        let handle = ctx
            .primary_image_handle()
            .map_err(|err| NormalizeError::Heif(format!("no primary image: {err}")))?;
        let decoded = lib_heif
            .decode(&handle, ColorSpace::Rgb(RgbChroma::Rgb), None)
            .map_err(|err| NormalizeError::Heif(err.to_string()))?;

        let planes = decoded.planes();
        let plane = planes
            .interleaved
            .ok_or_else(|| NormalizeError::Heif("no interleaved RGB plane".to_string()))?;
        let (width, height) = (plane.width, plane.height);
        let row_len = width as usize * 3;
        let mut raw = Vec::with_capacity(row_len * height as usize);
        for row in plane.data.chunks(plane.stride).take(height as usize) {
            let pixels = row
                .get(..row_len)
                .ok_or_else(|| NormalizeError::Heif("truncated RGB plane".to_string()))?;
            raw.extend_from_slice(pixels);
        }
        RgbImage::from_raw(width, height, raw)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| NormalizeError::Heif("RGB plane size mismatch".to_string()))
    }
}

#[cfg(not(feature = "heif"))]
mod heif {
    use image::DynamicImage;

    use super::NormalizeError;

    pub(super) fn decode(_bytes: &[u8]) -> Result<DynamicImage, NormalizeError> {
        Err(NormalizeError::HeifUnavailable)
    }
}
