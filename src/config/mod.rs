//! Gateway configuration: settings file, environment overrides and the
//! derived runtime values.
//!
//! Settings are read once at startup from a JSON file whose keys are the
//! PascalCase option names (`Temperature`, `MaxRequestsPerHour`, …). A missing
//! file is not an error; every option has a default. Each key can then be
//! overridden from the environment as `PROMPTGATE_` plus the key in upper
//! snake case, e.g. `PROMPTGATE_MAX_REQUESTS_PER_HOUR=100`. Unparseable
//! overrides are ignored with a warning.
//!
//! Files referenced by settings (templates, API key, debug response) are only
//! read by the accessor that needs them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::llm::openai::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::llm::prompt::{PromptTemplate, TemplateError};
use crate::llm::provider::ProviderError;
use crate::llm::relay::{
    DEFAULT_MAX_RESPONSE_TOKENS, DEFAULT_MIN_CHUNK_SIZE, DEFAULT_TEMPERATURE, RelaySettings,
};
use crate::quota::DEFAULT_WINDOW;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_API_KEY_VARIABLE: &str = "OPENAI_API_KEY";
pub const DEFAULT_DEBUG_RESPONSE_PATH: &str = "debugprompt.txt";

const ENV_PREFIX: &str = "PROMPTGATE_";

/// Errors raised while loading or interpreting settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid settings file {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{key} = {value} is outside {range}")]
    OutOfRange {
        key: &'static str,
        value: String,
        range: &'static str,
    },

    #[error("invalid query template: {0}")]
    Template(#[from] TemplateError),

    #[error("cannot set up completion provider: {0}")]
    Provider(#[from] ProviderError),
}

/// Raw settings as found in the file and environment.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GatewayConfig {
    pub listen: Option<String>,
    pub query_template: Option<String>,
    pub query_template_path: Option<PathBuf>,
    pub query_frontend: Option<String>,
    pub query_frontend_path: Option<PathBuf>,
    pub temperature: Option<f32>,
    pub api_key_variable_name: Option<String>,
    pub api_key_path: Option<PathBuf>,
    pub model: Option<String>,
    pub api_base_url: Option<String>,
    pub max_response_tokens: Option<i64>,
    pub max_request_length: Option<i64>,
    pub max_requests_per_hour: Option<i64>,
    pub quota_window_seconds: Option<u64>,
    pub debug_response: Option<bool>,
    pub debug_response_path: Option<PathBuf>,
    /// Inter-chunk delay in milliseconds.
    pub response_throttling: Option<u64>,
    pub response_min_chunk_size: Option<i64>,
}

impl GatewayConfig {
    /// Loads `path`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] or [`ConfigError::Json`] for an unreadable or
    /// malformed file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(?path, "settings file not found, using defaults");
            return Ok(Self::default());
        }
        debug!(?path, "loading settings from file");
        let content = read(path)?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_owned(),
            source,
        })
    }

    /// Applies `PROMPTGATE_*` overrides from the process environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides read through `lookup`, which maps a full variable
    /// name to its value.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str| env_override(&lookup, key, |v| Some(v.to_owned()));
        let path = |key: &str| env_override(&lookup, key, |v| Some(PathBuf::from(v)));

        self.listen = text("LISTEN").or(self.listen.take());
        self.query_template = text("QUERY_TEMPLATE").or(self.query_template.take());
        self.query_template_path = path("QUERY_TEMPLATE_PATH").or(self.query_template_path.take());
        self.query_frontend = text("QUERY_FRONTEND").or(self.query_frontend.take());
        self.query_frontend_path = path("QUERY_FRONTEND_PATH").or(self.query_frontend_path.take());
        self.api_key_variable_name =
            text("API_KEY_VARIABLE_NAME").or(self.api_key_variable_name.take());
        self.api_key_path = path("API_KEY_PATH").or(self.api_key_path.take());
        self.model = text("MODEL").or(self.model.take());
        self.api_base_url = text("API_BASE_URL").or(self.api_base_url.take());
        self.debug_response_path = path("DEBUG_RESPONSE_PATH").or(self.debug_response_path.take());

        if let Some(v) = env_override(&lookup, "TEMPERATURE", parse_number::<f32>) {
            self.temperature = Some(v);
        }
        if let Some(v) = env_override(&lookup, "MAX_RESPONSE_TOKENS", parse_number::<i64>) {
            self.max_response_tokens = Some(v);
        }
        if let Some(v) = env_override(&lookup, "MAX_REQUEST_LENGTH", parse_number::<i64>) {
            self.max_request_length = Some(v);
        }
        if let Some(v) = env_override(&lookup, "MAX_REQUESTS_PER_HOUR", parse_number::<i64>) {
            self.max_requests_per_hour = Some(v);
        }
        if let Some(v) = env_override(&lookup, "QUOTA_WINDOW_SECONDS", parse_number::<u64>) {
            self.quota_window_seconds = Some(v);
        }
        if let Some(v) = env_override(&lookup, "DEBUG_RESPONSE", parse_bool) {
            self.debug_response = Some(v);
        }
        if let Some(v) = env_override(&lookup, "RESPONSE_THROTTLING", parse_number::<u64>) {
            self.response_throttling = Some(v);
        }
        if let Some(v) = env_override(&lookup, "RESPONSE_MIN_CHUNK_SIZE", parse_number::<i64>) {
            self.response_min_chunk_size = Some(v);
        }
    }

    pub fn listen(&self) -> &str {
        self.listen.as_deref().unwrap_or(DEFAULT_LISTEN)
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn api_base_url(&self) -> &str {
        self.api_base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn debug_response(&self) -> bool {
        self.debug_response.unwrap_or(false)
    }

    /// Length of the quota reset window.
    ///
    /// # Errors
    ///
    /// [`ConfigError::OutOfRange`] for a zero-length window.
    pub fn quota_window(&self) -> Result<Duration, ConfigError> {
        match self.quota_window_seconds {
            None => Ok(DEFAULT_WINDOW),
            Some(0) => Err(ConfigError::OutOfRange {
                key: "QuotaWindowSeconds",
                value: "0".into(),
                range: ">= 1",
            }),
            Some(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    /// Builds validated relay settings. Template files are read here.
    ///
    /// # Errors
    ///
    /// [`ConfigError::OutOfRange`] for any invalid numeric option,
    /// [`ConfigError::Template`] for a malformed template, or
    /// [`ConfigError::Io`] if the template file cannot be read.
    pub fn relay_settings(&self) -> Result<RelaySettings, ConfigError> {
        let template = match choose("QueryTemplate", &self.query_template, &self.query_template_path)? {
            Some(text) => Some(text.parse::<PromptTemplate>()?),
            None => {
                warn!("no query template configured, sub-queries will be joined as-is");
                None
            }
        };

        let temperature = self.temperature.unwrap_or_else(|| {
            trace!(default = DEFAULT_TEMPERATURE, "Temperature not set, using default");
            DEFAULT_TEMPERATURE
        });

        let max_response_tokens = match self.max_response_tokens {
            None => {
                trace!(default = DEFAULT_MAX_RESPONSE_TOKENS, "MaxResponseTokens not set, using default");
                DEFAULT_MAX_RESPONSE_TOKENS
            }
            Some(v) => u32::try_from(v).map_err(|_| ConfigError::OutOfRange {
                key: "MaxResponseTokens",
                value: v.to_string(),
                range: "[1, 4096]",
            })?,
        };

        let max_prompt_length = self
            .max_request_length
            .map(|v| non_negative("MaxRequestLength", v))
            .transpose()?;

        let min_chunk_size = match self.response_min_chunk_size {
            None => {
                trace!(default = DEFAULT_MIN_CHUNK_SIZE, "ResponseMinChunkSize not set, using default");
                DEFAULT_MIN_CHUNK_SIZE
            }
            Some(v) => non_negative("ResponseMinChunkSize", v)?,
        };

        let settings = RelaySettings {
            template,
            temperature,
            max_response_tokens,
            max_prompt_length,
            min_chunk_size,
            inter_chunk_delay: Duration::from_millis(self.response_throttling.unwrap_or(0)),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// The client-facing template, if one is configured.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if `QueryFrontendPath` cannot be read.
    pub fn frontend_template(&self) -> Result<Option<String>, ConfigError> {
        choose("QueryFrontend", &self.query_frontend, &self.query_frontend_path)
    }

    /// Name of the environment variable holding the API key.
    pub fn api_key_variable(&self) -> &str {
        self.api_key_variable_name
            .as_deref()
            .unwrap_or(DEFAULT_API_KEY_VARIABLE)
    }

    /// Human-readable description of where the credential is expected.
    pub fn credential_source(&self) -> String {
        match &self.api_key_path {
            Some(path) => format!("file {}", path.display()),
            None => format!("environment variable {}", self.api_key_variable()),
        }
    }

    /// Resolves the provider API key from `ApiKeyPath`, falling back to the
    /// environment variable named by `ApiKeyVariableName`.
    ///
    /// Returns `Ok(None)` when neither yields a non-empty key.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the key file exists but cannot be read.
    pub fn api_key(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<SecretString>, ConfigError> {
        if let Some(path) = &self.api_key_path {
            if path.exists() {
                let key = read(path)?;
                let key = key.trim();
                if !key.is_empty() {
                    return Ok(Some(SecretString::from(key)));
                }
            }
            warn!(?path, "API key file missing or empty, trying environment");
        }
        Ok(env(self.api_key_variable())
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .map(SecretString::from))
    }

    /// The canned response replayed in debug mode, or `None` when debug mode
    /// is off.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if debug mode is on and the file cannot be read.
    pub fn debug_response_text(&self) -> Result<Option<String>, ConfigError> {
        if !self.debug_response() {
            return Ok(None);
        }
        let path = self
            .debug_response_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEBUG_RESPONSE_PATH));
        read(&path).map(Some)
    }
}

/// Picks the file contents when a path is set, else the inline value.
fn choose(
    key: &'static str,
    inline: &Option<String>,
    path: &Option<PathBuf>,
) -> Result<Option<String>, ConfigError> {
    match (inline, path) {
        (inline, Some(path)) => {
            if inline.is_some() {
                warn!(key, ?path, "both inline and file values set, the file wins");
            }
            let text = read(path)?;
            Ok(Some(text.trim_end_matches(['\r', '\n']).to_owned()))
        }
        (Some(text), None) => Ok(Some(text.clone())),
        (None, None) => Ok(None),
    }
}

fn non_negative(key: &'static str, value: i64) -> Result<usize, ConfigError> {
    usize::try_from(value).map_err(|_| ConfigError::OutOfRange {
        key,
        value: value.to_string(),
        range: ">= 0",
    })
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })
}

/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_override<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let name = format!("{ENV_PREFIX}{key}");
    let value = lookup(&name).filter(|v| !v.is_empty())?;
    let parsed = parse(&value);
    if parsed.is_none() {
        warn!(key = %name, value = %value, "invalid environment override, ignoring");
    }
    parsed
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}
