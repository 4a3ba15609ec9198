//! # promptgate
//!
//! A quota-gated gateway in front of a large-language-model completion API.
//!
//! Every request passes the hourly [`quota::QuotaGate`] first. Admitted
//! requests have their queries assembled into a prompt, and the provider's
//! streamed output is re-chunked by an [`llm::StreamingRelay`]. The relay is
//! then exposed in one of three shapes: an aggregated body, a chunked HTTP
//! body, or WebSocket text frames.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use promptgate::gateway::{self, App};
//! use promptgate::llm::RelaySettings;
//! use promptgate::llm::replay::ReplayProvider;
//! use promptgate::quota::QuotaGate;
//! use promptgate::server::Server;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gate = Arc::new(QuotaGate::new(10));
//!     let provider = Arc::new(ReplayProvider::new("Hello from the replay provider."));
//!     let pipeline = gateway::pipeline(Arc::new(App::new(gate, RelaySettings::default(), provider)));
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server
//!         .run(
//!             move |req| {
//!                 let pipeline = pipeline.clone();
//!                 async move { pipeline.handle(req).await }
//!             },
//!             CancellationToken::new(),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod config;
pub mod context;
pub mod gateway;
pub mod http;
pub mod llm;
pub mod middleware;
pub mod quota;
pub mod realtime;
pub mod router;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::Pipeline;
pub use router::Router;
pub use server::{Server, ServerError};
