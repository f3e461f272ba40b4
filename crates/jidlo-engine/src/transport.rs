use anyhow::Context;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::AnalyzerConfig;
use crate::outcome::{AnalysisOutcome, FailureKind};
use crate::request::AnalysisRequest;

/// Sends a built request and resolves it into an outcome.
pub trait AnalysisTransport {
    fn send(&self, request: &AnalysisRequest) -> AnalysisOutcome;
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentSegment>,
}

#[derive(Debug, Deserialize)]
struct ContentSegment {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

pub struct AnthropicTransport {
    endpoint: String,
    api_key: String,
    api_version: String,
    http: HttpClient,
}

impl AnthropicTransport {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            endpoint: config.messages_endpoint(),
            api_key: config.api_key().to_string(),
            api_version: config.api_version.clone(),
            http: HttpClient::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).context("API key is not a valid header value")?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_str(&self.api_version)
                .context("API version is not a valid header value")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn post(&self, request: &AnalysisRequest) -> anyhow::Result<(u16, String)> {
        let response: HttpResponse = self
            .http
            .post(&self.endpoint)
            .headers(self.headers()?)
            .json(&request.to_body())
            .send()
            .with_context(|| format!("request to {} failed", self.endpoint))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .context("response body read failed")?;
        Ok((status, body))
    }
}

impl AnalysisTransport for AnthropicTransport {
    fn send(&self, request: &AnalysisRequest) -> AnalysisOutcome {
        debug!(endpoint = %self.endpoint, model = request.model(), "sending analysis request");
        match self.post(request) {
            Ok((status, body)) => interpret_response(status, &body),
            Err(err) => {
                warn!(error = %err, "analysis transport failed");
                AnalysisOutcome::failure(FailureKind::Transport, error_chain_text(&err))
            }
        }
    }
}

/// Maps a raw HTTP exchange to an outcome. Only 2xx bodies are parsed.
pub fn interpret_response(status: u16, body: &str) -> AnalysisOutcome {
    if !(200..300).contains(&status) {
        return AnalysisOutcome::failure(
            FailureKind::HttpStatus(status),
            format!("API request failed with status {status}: {body}"),
        );
    }
    let parsed: MessagesResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return AnalysisOutcome::failure(
                FailureKind::MalformedResponse,
                format!("API returned invalid JSON ({err}): {body}"),
            )
        }
    };
    parsed
        .content
        .into_iter()
        .find(|segment| segment.kind == "text")
        .and_then(|segment| segment.text)
        .map(AnalysisOutcome::Success)
        .unwrap_or_else(|| {
            AnalysisOutcome::failure(
                FailureKind::MalformedResponse,
                format!("API response contained no text segment: {body}"),
            )
        })
}

fn error_chain_text(err: &anyhow::Error) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().is_some_and(|existing| existing == trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return err.to_string();
    }
    parts.join(" | caused by: ")
}

#[cfg(test)]
mod tests {
    use image::ImageFormat;
    use mockito::Matcher;
    use serde_json::json;

    use super::{interpret_response, AnalysisTransport, AnthropicTransport};
    use crate::config::{AnalyzerConfig, ConfigOptions};
    use crate::metadata::fixtures::{encode, two_tone};
    use crate::normalize::{Normalizer, UploadedImage};
    use crate::outcome::{AnalysisOutcome, FailureKind};
    use crate::request::{build_request, AnalysisRequest};

    fn config_for(api_base: &str) -> anyhow::Result<AnalyzerConfig> {
        let options = ConfigOptions {
            api_base: Some(api_base.to_string()),
            secrets_path: Some("/nonexistent/secrets.toml".into()),
            ..ConfigOptions::default()
        };
        Ok(AnalyzerConfig::resolve(&options, |key| {
            (key == "ANTHROPIC_API_KEY").then(|| "sk-test".to_string())
        })?)
    }

    fn sample_request(config: &AnalyzerConfig) -> anyhow::Result<AnalysisRequest> {
        let upload = UploadedImage::new(encode(&two_tone(16, 16), ImageFormat::Jpeg), "image/jpeg");
        Ok(build_request(config, Normalizer::default().normalize(&upload)?))
    }

    #[test]
    fn success_returns_first_text_segment_verbatim() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let analysis = "Název jídla:\nSvíčková na smetaně\n\nKalorická hodnota:\n~850 kcal";
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-test")
            .match_header("anthropic-version", "2023-06-01")
            .match_header("content-type", "application/json")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({ "max_tokens": 1000 })),
                Matcher::Regex(r#""media_type":"image/jpeg""#.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id": "msg_01",
                    "type": "message",
                    "role": "assistant",
                    "content": [{"type": "text", "text": analysis}],
                    "stop_reason": "end_turn",
                })
                .to_string(),
            )
            .create();

        let config = config_for(&server.url())?;
        let outcome = AnthropicTransport::new(&config).send(&sample_request(&config)?);
        mock.assert();
        assert_eq!(outcome, AnalysisOutcome::Success(analysis.to_string()));
        Ok(())
    }

    #[test]
    fn non_success_status_reports_code_and_body() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let mock = server
            .mock("POST", "/v1/messages")
            .with_status(529)
            .with_body(body)
            .create();

        let config = config_for(&server.url())?;
        let outcome = AnthropicTransport::new(&config).send(&sample_request(&config)?);
        mock.assert();
        let failure = outcome.as_failure().expect("non-200 must fail");
        assert_eq!(failure.kind, FailureKind::HttpStatus(529));
        assert!(failure.detail.contains("529"));
        assert!(failure.detail.contains("Overloaded"));
        Ok(())
    }

    #[test]
    fn connection_refused_is_a_transport_failure() -> anyhow::Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let address = listener.local_addr()?;
        drop(listener);

        let config = config_for(&format!("http://{address}"))?;
        let outcome = AnthropicTransport::new(&config).send(&sample_request(&config)?);
        let failure = outcome.as_failure().expect("nothing is listening");
        assert_eq!(failure.kind, FailureKind::Transport);
        assert!(failure.detail.contains("request to"));
        Ok(())
    }

    #[test]
    fn unauthorized_is_not_confused_with_success() {
        let outcome = interpret_response(401, r#"{"error":"invalid x-api-key"}"#);
        assert!(!outcome.is_success());
        assert!(outcome.text().is_none());
        assert_eq!(
            outcome.as_failure().map(|failure| failure.kind),
            Some(FailureKind::HttpStatus(401))
        );
    }

    #[test]
    fn invalid_json_on_success_status_is_malformed() {
        let outcome = interpret_response(200, "<html>gateway</html>");
        let failure = outcome.as_failure().expect("not json");
        assert_eq!(failure.kind, FailureKind::MalformedResponse);
        assert!(failure.detail.contains("<html>gateway</html>"));
    }

    #[test]
    fn response_without_text_segment_is_malformed() {
        let outcome = interpret_response(200, r#"{"content":[]}"#);
        assert_eq!(
            outcome.as_failure().map(|failure| failure.kind),
            Some(FailureKind::MalformedResponse)
        );
    }

    #[test]
    fn first_text_segment_wins() {
        let outcome = interpret_response(
            200,
            r#"{"content":[{"type":"text","text":"první"},{"type":"text","text":"druhý"}]}"#,
        );
        assert_eq!(outcome.text(), Some("první"));
    }
}
