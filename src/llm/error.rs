//! Error taxonomy for a single relayed completion.

use thiserror::Error;

use super::provider::ProviderError;
use crate::config::ConfigError;

/// Everything that can stop a completion from reaching the caller.
///
/// Validation variants are raised before the provider is contacted, so a
/// caller can reject the request without side effects; see
/// [`RelayError::is_validation`].
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("request quota exhausted for the current window")]
    QuotaExceeded,

    #[error("invalid relay configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("template expects {expected} sub-queries, got {supplied}")]
    TemplateMismatch { expected: usize, supplied: usize },

    #[error("prompt is {length} characters long, the maximum is {max}")]
    PromptTooLong { length: usize, max: usize },

    #[error("provider credential not found ({0})")]
    MissingCredential(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("request cancelled by the caller")]
    Cancelled,
}

impl RelayError {
    /// `true` for errors detected before any provider call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::TemplateMismatch { .. }
                | Self::PromptTooLong { .. }
                | Self::MissingCredential(_)
        )
    }

    /// `true` when the caller gave up; never a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
