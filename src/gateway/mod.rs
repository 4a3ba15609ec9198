//! The gateway application: shared state plus the HTTP and WebSocket routes
//! that put a [`StreamingRelay`] behind each transport shape.
//!
//! | Method | Path | Shape |
//! |---|---|---|
//! | `POST` | `/api/queries` | JSON array body, aggregated `text/plain` reply |
//! | `GET` | `/api/query?query=…` | single query, aggregated |
//! | `POST` | `/api/queries/stream` | JSON array body, chunked reply |
//! | `GET` | `/api/query/stream?query=…` | single query, chunked |
//! | `GET` | `/api/queries/ws` | WebSocket, queries in the first message |
//! | `GET` | `/api/query/ws?query=…` | WebSocket, single query from the URL |
//! | `GET` | `/api/template` | the client-facing template |

mod handlers;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use handlers::{close_code_for, error_response, status_for};

use crate::config::{ConfigError, GatewayConfig};
use crate::context::Context;
use crate::llm::openai::OpenAiProvider;
use crate::llm::replay::ReplayProvider;
use crate::llm::{CompletionProvider, RelayError, RelaySettings, RelayStream, StreamingRelay};
use crate::middleware::{AccessLog, Pipeline};
use crate::quota::QuotaGate;
use crate::{Response, Router};

/// The completion provider, or why there is none.
enum ProviderSlot {
    Ready(Arc<dyn CompletionProvider>),
    /// No credential was found; carries where it was looked for.
    MissingCredential(String),
}

/// State shared by every request handler.
pub struct App {
    gate: Arc<QuotaGate>,
    settings: Arc<RelaySettings>,
    provider: ProviderSlot,
    frontend_template: Option<String>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let provider = match &self.provider {
            ProviderSlot::Ready(provider) => provider.name().to_owned(),
            ProviderSlot::MissingCredential(source) => format!("missing credential ({source})"),
        };
        f.debug_struct("App")
            .field("gate", &self.gate)
            .field("settings", &self.settings)
            .field("provider", &provider)
            .finish_non_exhaustive()
    }
}

impl App {
    pub fn new(
        gate: Arc<QuotaGate>,
        settings: RelaySettings,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            gate,
            settings: Arc::new(settings),
            provider: ProviderSlot::Ready(provider),
            frontend_template: None,
        }
    }

    #[must_use]
    pub fn with_frontend_template(mut self, template: Option<String>) -> Self {
        self.frontend_template = template;
        self
    }

    /// Builds the application from loaded settings.
    ///
    /// In debug mode the canned response replaces the provider. Otherwise a
    /// missing API key is not fatal: the gateway starts, and completion
    /// requests are rejected until it is restarted with a credential.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from validating settings or reading the files they
    /// reference.
    pub fn from_config(config: &GatewayConfig, gate: Arc<QuotaGate>) -> Result<Self, ConfigError> {
        let settings = config.relay_settings()?;
        let frontend_template = config.frontend_template()?;

        let provider = if let Some(text) = config.debug_response_text()? {
            info!(chars = text.chars().count(), "debug mode, replaying canned response");
            ProviderSlot::Ready(Arc::new(ReplayProvider::new(text)))
        } else {
            match config.api_key(|name| std::env::var(name).ok())? {
                Some(key) => ProviderSlot::Ready(Arc::new(OpenAiProvider::new(
                    config.api_base_url(),
                    config.model(),
                    key,
                )?)),
                None => {
                    let source = config.credential_source();
                    warn!(source = %source, "no API key found, completion requests will be rejected");
                    ProviderSlot::MissingCredential(source)
                }
            }
        };

        Ok(Self {
            gate,
            settings: Arc::new(settings),
            provider,
            frontend_template,
        })
    }

    pub fn gate(&self) -> &QuotaGate {
        &self.gate
    }

    pub fn frontend_template(&self) -> Option<&str> {
        self.frontend_template.as_deref()
    }

    /// Admits one completion. The credential is checked before quota is
    /// spent.
    ///
    /// # Errors
    ///
    /// [`RelayError::MissingCredential`], or whatever
    /// [`StreamingRelay::admit`] reports.
    pub fn relay(&self) -> Result<StreamingRelay, RelayError> {
        let provider = match &self.provider {
            ProviderSlot::Ready(provider) => Arc::clone(provider),
            ProviderSlot::MissingCredential(source) => {
                return Err(RelayError::MissingCredential(source.clone()));
            }
        };
        StreamingRelay::admit(&self.gate, Arc::clone(&self.settings), provider)
    }

    /// Admits a completion and starts streaming it for `queries`.
    ///
    /// # Errors
    ///
    /// Any admission or validation [`RelayError`].
    pub fn start(&self, queries: &[String], cancel: CancellationToken) -> Result<RelayStream, RelayError> {
        self.relay()?.stream(queries, cancel)
    }
}

fn with_app<F, Fut>(app: &Arc<App>, handler: F) -> impl Fn(Context) -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<App>, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let app = Arc::clone(app);
    move |ctx| handler(Arc::clone(&app), ctx)
}

/// Registers every gateway endpoint.
pub fn routes(app: Arc<App>) -> Router {
    let mut router = Router::new();
    router.post("/api/queries", with_app(&app, handlers::post_queries));
    router.get("/api/query", with_app(&app, handlers::get_query));
    router.post("/api/queries/stream", with_app(&app, handlers::post_queries_stream));
    router.get("/api/query/stream", with_app(&app, handlers::get_query_stream));
    router.get("/api/queries/ws", with_app(&app, handlers::queries_socket));
    router.get("/api/query/ws", with_app(&app, handlers::query_socket));
    router.get("/api/template", with_app(&app, handlers::template));
    router
}

/// The routes behind the access log.
pub fn pipeline(app: Arc<App>) -> Pipeline {
    Pipeline::new(routes(app)).with(AccessLog)
}
