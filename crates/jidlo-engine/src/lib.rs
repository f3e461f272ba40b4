use std::time::Instant;

use jidlo_contracts::events::{EventPayload, EventWriter};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

pub mod config;
pub mod metadata;
pub mod normalize;
pub mod outcome;
pub mod request;
pub mod transport;

pub use config::{AnalyzerConfig, ConfigError, ConfigOptions};
pub use normalize::{
    NormalizeError, NormalizedImage, Normalizer, Rotation, SourceFormat, UploadedImage,
    CANONICAL_MEDIA_TYPE,
};
pub use outcome::{AnalysisFailure, AnalysisOutcome, FailureKind};
pub use request::{build_request, AnalysisRequest};
pub use transport::{AnalysisTransport, AnthropicTransport};

const EVENT_DETAIL_MAX_CHARS: usize = 512;

/// Where the current submission stands. A new submission always starts over.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubmissionState {
    #[default]
    Idle,
    Submitted,
    Resolved(AnalysisOutcome),
}

/// Runs submissions one at a time: normalize, build, send, resolve.
pub struct FoodAnalyzer<T = AnthropicTransport> {
    config: AnalyzerConfig,
    normalizer: Normalizer,
    transport: T,
    events: EventWriter,
    state: SubmissionState,
}

impl FoodAnalyzer<AnthropicTransport> {
    pub fn new(config: AnalyzerConfig, events: EventWriter) -> Self {
        let transport = AnthropicTransport::new(&config);
        Self::with_transport(config, transport, events)
    }
}

impl<T: AnalysisTransport> FoodAnalyzer<T> {
    pub fn with_transport(config: AnalyzerConfig, transport: T, events: EventWriter) -> Self {
        let analyzer = Self {
            config,
            normalizer: Normalizer::default(),
            transport,
            events,
            state: SubmissionState::Idle,
        };
        if let Some(reason) = analyzer.config.model_fallback_reason.as_deref() {
            warn!(model = %analyzer.config.model.name, reason, "using fallback model");
            analyzer.emit(
                "model_fallback",
                map_object(json!({
                    "model": analyzer.config.model.name,
                    "reason": reason,
                })),
            );
        }
        analyzer
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn state(&self) -> &SubmissionState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Consumes one upload and blocks until the analysis resolves.
    /// A normalization failure resolves without contacting the API.
    pub fn submit(&mut self, upload: UploadedImage) -> AnalysisOutcome {
        let started = Instant::now();
        let submission_id = Uuid::new_v4().to_string();
        self.state = SubmissionState::Submitted;
        info!(
            submission_id = %submission_id,
            media_type = upload.media_type(),
            bytes = upload.len(),
            "submission started"
        );
        self.emit(
            "submission_started",
            map_object(json!({
                "submission_id": submission_id,
                "media_type": upload.media_type(),
                "bytes": upload.len(),
                "exif_orientation": upload.orientation(),
            })),
        );

        let normalized = match self.normalizer.normalize(&upload) {
            Ok(normalized) => normalized,
            Err(err) => {
                warn!(submission_id = %submission_id, error = %err, "normalization failed");
                self.emit(
                    "normalization_failed",
                    map_object(json!({
                        "submission_id": submission_id,
                        "error": err.to_string(),
                    })),
                );
                let outcome = AnalysisOutcome::failure(FailureKind::Normalization, err.to_string());
                return self.resolve(&submission_id, outcome, started);
            }
        };
        drop(upload);

        let (width, height) = normalized.dimensions();
        self.emit(
            "image_normalized",
            map_object(json!({
                "submission_id": submission_id,
                "media_type": normalized.media_type(),
                "width": width,
                "height": height,
                "rotation_degrees": normalized.rotation().degrees(),
                "exif_attached": normalized.exif_attached(),
                "bytes": normalized.bytes().len(),
                "sha256": normalized.sha256_hex(),
            })),
        );

        let request = build_request(&self.config, normalized);
        if self.events.path().is_some() {
            self.emit(
                "analysis_requested",
                map_object(json!({
                    "submission_id": submission_id,
                    "endpoint": self.config.messages_endpoint(),
                    "body": request.to_body(),
                })),
            );
        }
        let outcome = self.transport.send(&request);
        self.resolve(&submission_id, outcome, started)
    }

    fn resolve(
        &mut self,
        submission_id: &str,
        outcome: AnalysisOutcome,
        started: Instant,
    ) -> AnalysisOutcome {
        let elapsed_s = started.elapsed().as_secs_f64();
        let mut payload = map_object(json!({
            "submission_id": submission_id,
            "outcome": outcome.label(),
            "latency_s": elapsed_s,
        }));
        match &outcome {
            AnalysisOutcome::Success(text) => {
                info!(submission_id, chars = text.chars().count(), "analysis resolved");
                payload.insert("text_chars".to_string(), json!(text.chars().count()));
            }
            AnalysisOutcome::Failure(failure) => {
                warn!(submission_id, kind = failure.kind.label(), "analysis failed");
                if let FailureKind::HttpStatus(code) = failure.kind {
                    payload.insert("status".to_string(), json!(code));
                }
                payload.insert(
                    "detail".to_string(),
                    json!(truncate_text(&failure.detail, EVENT_DETAIL_MAX_CHARS)),
                );
            }
        }
        self.emit("analysis_resolved", payload);
        self.state = SubmissionState::Resolved(outcome.clone());
        outcome
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.events.emit(event_type, payload) {
            warn!(event_type, error = %err, "failed to record event");
        }
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;

    use image::ImageFormat;
    use jidlo_contracts::events::EventWriter;
    use serde_json::Value;

    use super::{
        AnalysisOutcome, AnalysisRequest, AnalysisTransport, AnalyzerConfig, ConfigOptions,
        FailureKind, FoodAnalyzer, SubmissionState, UploadedImage,
    };
    use crate::metadata::fixtures::{encode, jpeg_with_orientation, two_tone};

    struct StubTransport {
        reply: AnalysisOutcome,
        bodies: RefCell<Vec<Value>>,
    }

    impl StubTransport {
        fn replying(reply: AnalysisOutcome) -> Self {
            Self {
                reply,
                bodies: RefCell::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.bodies.borrow().len()
        }
    }

    impl AnalysisTransport for StubTransport {
        fn send(&self, request: &AnalysisRequest) -> AnalysisOutcome {
            self.bodies.borrow_mut().push(request.to_body());
            self.reply.clone()
        }
    }

    fn config(model: Option<&str>) -> anyhow::Result<AnalyzerConfig> {
        let options = ConfigOptions {
            model: model.map(str::to_string),
            secrets_path: Some("/nonexistent/secrets.toml".into()),
            ..ConfigOptions::default()
        };
        Ok(AnalyzerConfig::resolve(&options, |key| {
            (key == "ANTHROPIC_API_KEY").then(|| "sk-test".to_string())
        })?)
    }

    fn event_types(path: &Path) -> anyhow::Result<Vec<String>> {
        let raw = fs::read_to_string(path)?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    #[test]
    fn analyzer_starts_idle() -> anyhow::Result<()> {
        let analyzer = FoodAnalyzer::with_transport(
            config(None)?,
            StubTransport::replying(AnalysisOutcome::Success(String::new())),
            EventWriter::discard("run"),
        );
        assert_eq!(analyzer.state(), &SubmissionState::Idle);
        Ok(())
    }

    #[test]
    fn successful_submission_forwards_canonical_image() -> anyhow::Result<()> {
        let reply = AnalysisOutcome::Success("Název jídla: Guláš".to_string());
        let mut analyzer = FoodAnalyzer::with_transport(
            config(None)?,
            StubTransport::replying(reply.clone()),
            EventWriter::discard("run"),
        );
        let upload = UploadedImage::new(encode(&two_tone(16, 16), ImageFormat::Png), "image/png");

        let outcome = analyzer.submit(upload);
        assert_eq!(outcome, reply);
        assert_eq!(analyzer.state(), &SubmissionState::Resolved(reply));
        assert_eq!(analyzer.transport().calls(), 1);
        let bodies = analyzer.transport().bodies.borrow();
        let body = &bodies[0];
        assert_eq!(
            body["messages"][0]["content"][1]["source"]["media_type"],
            Value::String("image/jpeg".to_string())
        );
        Ok(())
    }

    #[test]
    fn corrupt_upload_never_reaches_transport() -> anyhow::Result<()> {
        let mut analyzer = FoodAnalyzer::with_transport(
            config(None)?,
            StubTransport::replying(AnalysisOutcome::Success("unused".to_string())),
            EventWriter::discard("run"),
        );
        let outcome = analyzer.submit(UploadedImage::new(b"not an image".to_vec(), "image/jpeg"));

        assert_eq!(analyzer.transport().calls(), 0);
        let failure = outcome.as_failure().expect("corrupt upload fails");
        assert_eq!(failure.kind, FailureKind::Normalization);
        assert!(matches!(
            analyzer.state(),
            SubmissionState::Resolved(AnalysisOutcome::Failure(_))
        ));
        Ok(())
    }

    #[test]
    fn transport_failure_is_surfaced_as_outcome() -> anyhow::Result<()> {
        let reply = AnalysisOutcome::failure(
            FailureKind::HttpStatus(500),
            "API request failed with status 500: boom",
        );
        let mut analyzer = FoodAnalyzer::with_transport(
            config(None)?,
            StubTransport::replying(reply.clone()),
            EventWriter::discard("run"),
        );
        let upload = jpeg_with_orientation(&two_tone(10, 20), 6);
        let outcome = analyzer.submit(UploadedImage::new(upload, "image/jpeg"));
        assert_eq!(outcome, reply);
        assert!(outcome.text().is_none());
        Ok(())
    }

    #[test]
    fn each_submission_restarts_the_sequence() -> anyhow::Result<()> {
        let mut analyzer = FoodAnalyzer::with_transport(
            config(None)?,
            StubTransport::replying(AnalysisOutcome::Success("ok".to_string())),
            EventWriter::discard("run"),
        );
        let first = analyzer.submit(UploadedImage::new(Vec::new(), "image/png"));
        assert!(!first.is_success());

        let upload = encode(&two_tone(8, 8), ImageFormat::Jpeg);
        let second = analyzer.submit(UploadedImage::new(upload, "image/jpeg"));
        assert!(second.is_success());
        assert_eq!(
            analyzer.state(),
            &SubmissionState::Resolved(AnalysisOutcome::Success("ok".to_string()))
        );
        assert_eq!(analyzer.transport().calls(), 1);
        Ok(())
    }

    #[test]
    fn events_follow_submission_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let mut analyzer = FoodAnalyzer::with_transport(
            config(None)?,
            StubTransport::replying(AnalysisOutcome::Success("ok".to_string())),
            EventWriter::new(&events_path, "run-1"),
        );
        let upload = jpeg_with_orientation(&two_tone(10, 20), 6);
        analyzer.submit(UploadedImage::new(upload, "image/jpeg"));

        assert_eq!(
            event_types(&events_path)?,
            vec![
                "submission_started",
                "image_normalized",
                "analysis_requested",
                "analysis_resolved",
            ]
        );

        let raw = fs::read_to_string(&events_path)?;
        let rows: Vec<Value> = raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        assert_eq!(rows[0]["exif_orientation"], Value::from(6));
        assert_eq!(rows[1]["width"], Value::from(20));
        assert_eq!(rows[1]["height"], Value::from(10));
        assert_eq!(rows[1]["rotation_degrees"], Value::from(270));
        let data = rows[2]["body"]["messages"][0]["content"][1]["source"]["data"]
            .as_str()
            .unwrap_or_default();
        assert!(data.starts_with("<omitted"));
        assert_eq!(rows[3]["outcome"], Value::from("success"));
        Ok(())
    }

    #[test]
    fn normalization_failure_events_skip_request() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let mut analyzer = FoodAnalyzer::with_transport(
            config(None)?,
            StubTransport::replying(AnalysisOutcome::Success("unused".to_string())),
            EventWriter::new(&events_path, "run-1"),
        );
        analyzer.submit(UploadedImage::new(b"GIF89a".to_vec(), "image/gif"));
        assert_eq!(
            event_types(&events_path)?,
            vec![
                "submission_started",
                "normalization_failed",
                "analysis_resolved"
            ]
        );
        Ok(())
    }

    #[test]
    fn model_fallback_is_recorded() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let _analyzer = FoodAnalyzer::with_transport(
            config(Some("not-a-model"))?,
            StubTransport::replying(AnalysisOutcome::Success(String::new())),
            EventWriter::new(&events_path, "run-1"),
        );
        assert_eq!(event_types(&events_path)?, vec!["model_fallback"]);
        Ok(())
    }
}
