//! Per-request context handed to middleware and route handlers.
//!
//! A [`Context`] wraps the parsed [`Request`] with the helpers handlers need:
//! body decoding and the client's cancellation signal.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::Request;

/// Per-request state.
pub struct Context {
    request: Request,
    received_at: Instant,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self {
            request,
            received_at: Instant::now(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// When the request entered the pipeline.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// The signal that fires when the client connection goes away.
    pub fn cancellation(&self) -> CancellationToken {
        self.request.cancellation().clone()
    }

    /// Decode the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }

    /// Returns a decoded query-string parameter.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.request.query_param(key)
    }
}
