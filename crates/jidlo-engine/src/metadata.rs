//! EXIF handling for uploads: orientation lookup and raw payload carry-over.
//!
//! The payload is never re-serialized. It travels as the original TIFF block
//! and is attached to the re-encoded JPEG as an APP1 segment.

use std::io::Cursor;

use exif::{In, Reader, Tag};

const ORIENTATION_TAG: u16 = 0x0112;
const TIFF_TYPE_SHORT: u16 = 3;
const EXIF_APP1_HEADER: &[u8] = b"Exif\0\0";
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_APP0: [u8; 2] = [0xFF, 0xE0];
const JPEG_APP1: [u8; 2] = [0xFF, 0xE1];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExifPayload {
    /// TIFF-structured EXIF data as found in the container.
    pub tiff: Vec<u8>,
    pub orientation: Option<u32>,
}

/// Reads the EXIF block from any container kamadak-exif understands.
/// Missing or unreadable EXIF is not an error.
pub fn read_exif(bytes: &[u8]) -> Option<ExifPayload> {
    let exif = Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;
    let orientation = exif
        .get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|field| field.value.get_uint(0));
    Some(ExifPayload {
        tiff: exif.buf().to_vec(),
        orientation,
    })
}

/// Rewrites the IFD0 orientation entry to 1 in place.
/// Returns false when the block has no patchable orientation entry.
pub fn reset_orientation(tiff: &mut [u8]) -> bool {
    let little_endian = match tiff.get(0..2) {
        Some(b"II") => true,
        Some(b"MM") => false,
        _ => return false,
    };
    let read_u16 = |buf: &[u8], at: usize| -> Option<u16> {
        let raw = buf.get(at..at + 2)?;
        let pair = [raw[0], raw[1]];
        Some(if little_endian {
            u16::from_le_bytes(pair)
        } else {
            u16::from_be_bytes(pair)
        })
    };
    let read_u32 = |buf: &[u8], at: usize| -> Option<u32> {
        let raw = buf.get(at..at + 4)?;
        let quad = [raw[0], raw[1], raw[2], raw[3]];
        Some(if little_endian {
            u32::from_le_bytes(quad)
        } else {
            u32::from_be_bytes(quad)
        })
    };

    let Some(ifd_offset) = read_u32(tiff, 4).map(|value| value as usize) else {
        return false;
    };
    let Some(entry_count) = read_u16(tiff, ifd_offset) else {
        return false;
    };
    for idx in 0..entry_count as usize {
        let entry = ifd_offset + 2 + idx * 12;
        if read_u16(tiff, entry) != Some(ORIENTATION_TAG) {
            continue;
        }
        // A single SHORT is stored left-justified in the value field.
        if read_u16(tiff, entry + 2) != Some(TIFF_TYPE_SHORT) {
            return false;
        }
        let upright = if little_endian {
            1u16.to_le_bytes()
        } else {
            1u16.to_be_bytes()
        };
        let Some(slot) = tiff.get_mut(entry + 8..entry + 10) else {
            return false;
        };
        slot.copy_from_slice(&upright);
        return true;
    }
    false
}

/// Inserts `tiff` as an EXIF APP1 segment, after the JFIF APP0 header when
/// the encoder wrote one. Returns `None` when the payload does not fit a
/// single segment or `jpeg` is not a JPEG stream.
pub fn attach_exif(jpeg: &[u8], tiff: &[u8]) -> Option<Vec<u8>> {
    let segment_len = 2 + EXIF_APP1_HEADER.len() + tiff.len();
    let segment_len = u16::try_from(segment_len).ok()?;
    if jpeg.get(0..2)? != JPEG_SOI {
        return None;
    }

    let mut insert_at = 2;
    if jpeg.get(2..4) == Some(&JPEG_APP0[..]) {
        let len = jpeg.get(4..6)?;
        insert_at = 4 + u16::from_be_bytes([len[0], len[1]]) as usize;
    }
    if insert_at > jpeg.len() {
        return None;
    }

    let mut out = Vec::with_capacity(jpeg.len() + segment_len as usize + 2);
    out.extend_from_slice(&jpeg[..insert_at]);
    out.extend_from_slice(&JPEG_APP1);
    out.extend_from_slice(&segment_len.to_be_bytes());
    out.extend_from_slice(EXIF_APP1_HEADER);
    out.extend_from_slice(tiff);
    out.extend_from_slice(&jpeg[insert_at..]);
    Some(out)
}
