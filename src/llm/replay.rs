//! Canned-response provider used when `DebugResponse` is enabled.

use std::sync::Arc;

use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;

use super::provider::{CompletionProvider, CompletionRequest, Fragment, FragmentStream};

/// Replays a fixed text one character per fragment, ignoring the prompt.
#[derive(Debug, Clone)]
pub struct ReplayProvider {
    text: Arc<str>,
}

impl ReplayProvider {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self { text: text.into() }
    }
}

impl CompletionProvider for ReplayProvider {
    fn name(&self) -> &str {
        "replay"
    }

    fn generate(&self, _request: CompletionRequest, cancel: CancellationToken) -> FragmentStream {
        let fragments: Vec<_> = self
            .text
            .chars()
            .map(|c| Ok(Fragment::ok(c.to_string())))
            .collect();
        Box::pin(stream::iter(fragments).take_until(cancel.cancelled_owned()))
    }
}
