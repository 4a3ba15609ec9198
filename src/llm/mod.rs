//! LLM integration: prompt assembly, completion providers and the
//! streaming relay that re-chunks provider output for transports.
//!
//! Data flows leaf-first through the submodules:
//!
//! [`prompt`] builds the prompt → a [`provider::CompletionProvider`] turns it
//! into fragments → [`chunker`] regroups fragments into chunks → [`relay`]
//! drives the whole thing as one cancellable [`futures::Stream`].

pub mod chunker;
pub mod error;
pub mod openai;
pub mod prompt;
pub mod provider;
pub mod relay;
pub mod replay;
pub mod sse;

pub use error::RelayError;
pub use prompt::{PromptTemplate, TemplateError};
pub use provider::{CompletionProvider, CompletionRequest, Fragment, FragmentStream, ProviderError};
pub use relay::{RelaySettings, RelayState, RelayStream, StreamingRelay};
