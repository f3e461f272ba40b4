use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Normalization,
    HttpStatus(u16),
    Transport,
    MalformedResponse,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Normalization => "normalization",
            Self::HttpStatus(_) => "http_status",
            Self::Transport => "transport",
            Self::MalformedResponse => "malformed_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl fmt::Display for AnalysisFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

/// Result of one submission. Failures are values, not errors: every
/// recoverable problem ends up here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Success(String),
    Failure(AnalysisFailure),
}

impl AnalysisOutcome {
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::Failure(AnalysisFailure {
            kind,
            detail: detail.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Success(text) => Some(text),
            Self::Failure(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&AnalysisFailure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(failure) => failure.kind.label(),
        }
    }
}
