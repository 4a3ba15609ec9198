//! The completion-provider capability the relay is written against.
//!
//! A provider turns a prompt plus generation parameters into a lazy,
//! cancellable stream of [`Fragment`]s. Nothing happens until the stream is
//! first polled, and dropping the stream abandons the underlying request.

use std::pin::Pin;

use futures::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failures reported by a completion provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed provider event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("provider stream failed: {0}")]
    Stream(String),
}

/// Parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A unit of generated text as the provider produced it.
///
/// Fragments the provider marks unsuccessful are dropped by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub successful: bool,
}

impl Fragment {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            successful: true,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            text: reason.into(),
            successful: false,
        }
    }
}

/// The lazy fragment sequence returned by [`CompletionProvider::generate`].
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, ProviderError>> + Send>>;

/// Something that can generate text for a prompt.
pub trait CompletionProvider: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Starts a generation. Implementations must stop producing fragments
    /// once `cancel` fires.
    fn generate(&self, request: CompletionRequest, cancel: CancellationToken) -> FragmentStream;
}
