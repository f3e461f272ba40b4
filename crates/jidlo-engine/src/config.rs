use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use jidlo_contracts::models::{ModelSelector, ModelSpec, VISION_CAPABILITY};
use jidlo_contracts::prompts::{default_prompt, find_prompt, PromptTemplate};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";
pub const API_BASE_VAR: &str = "ANTHROPIC_API_BASE";
pub const SECRETS_FILE_VAR: &str = "JIDLO_SECRETS_FILE";
pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
pub const DEFAULT_SECRETS_PATH: &str = ".jidlo/secrets.toml";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ANTHROPIC_API_KEY is not set (checked the environment, .env and {})", .secrets.display())]
    MissingApiKey { secrets: PathBuf },
    #[error("failed to read secrets file {}: {source}", .path.display())]
    SecretsRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid secrets file {}: {source}", .path.display())]
    SecretsParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown prompt template '{0}'")]
    UnknownPrompt(String),
    #[error("{0}")]
    ModelSelection(String),
}

/// Caller-supplied overrides; everything left `None` uses the defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub secrets_path: Option<PathBuf>,
    pub api_base: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SecretsFile {
    #[serde(rename = "ANTHROPIC_API_KEY")]
    anthropic_api_key: Option<String>,
}

/// Process-wide settings, built once at startup and passed by reference.
#[derive(Clone)]
pub struct AnalyzerConfig {
    api_key: String,
    pub api_base: String,
    pub api_version: String,
    pub model: ModelSpec,
    /// Why the model differs from what was asked for, if it does.
    pub model_fallback_reason: Option<String>,
    pub max_tokens: u32,
    pub prompt: &'static PromptTemplate,
}

impl fmt::Debug for AnalyzerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzerConfig")
            .field("api_key", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("api_version", &self.api_version)
            .field("model", &self.model.name)
            .field("max_tokens", &self.max_tokens)
            .field("prompt", &self.prompt.id)
            .finish()
    }
}

impl AnalyzerConfig {
    /// Loads `.env` into the process environment, then resolves against it.
    pub fn load(options: &ConfigOptions) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env"),
            Err(err) if err.not_found() => {}
            Err(err) => debug!(error = %err, "ignoring unreadable .env"),
        }
        Self::resolve(options, non_empty_env)
    }

    /// Resolution with an injectable variable lookup.
    pub fn resolve(
        options: &ConfigOptions,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let secrets_path = options
            .secrets_path
            .clone()
            .or_else(|| lookup(SECRETS_FILE_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SECRETS_PATH));

        let api_key = match lookup(API_KEY_VAR) {
            Some(key) => key,
            None => read_secrets(&secrets_path)?
                .anthropic_api_key
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ConfigError::MissingApiKey {
                    secrets: secrets_path.clone(),
                })?,
        };

        let api_base = options
            .api_base
            .clone()
            .or_else(|| lookup(API_BASE_VAR))
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let selection = ModelSelector::new(None)
            .select(options.model.as_deref(), VISION_CAPABILITY)
            .map_err(ConfigError::ModelSelection)?;
        // Picking the default silently is expected when nothing was asked for.
        let model_fallback_reason = selection
            .requested
            .as_ref()
            .and(selection.fallback_reason.clone());

        let prompt = match options.prompt.as_deref() {
            Some(id) => find_prompt(id).ok_or_else(|| ConfigError::UnknownPrompt(id.to_string()))?,
            None => default_prompt(),
        };

        let max_tokens = selection
            .model
            .clamp_output_tokens(options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS));

        Ok(Self {
            api_key,
            api_base,
            api_version: ANTHROPIC_VERSION.to_string(),
            model: selection.model,
            model_fallback_reason,
            max_tokens,
            prompt,
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn messages_endpoint(&self) -> String {
        format!("{}/v1/messages", self.api_base)
    }
}

fn read_secrets(path: &Path) -> Result<SecretsFile, ConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(SecretsFile::default()),
        Err(source) => {
            return Err(ConfigError::SecretsRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&raw).map_err(|source| ConfigError::SecretsParse {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
