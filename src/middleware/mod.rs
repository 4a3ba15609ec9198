//! Middleware pipeline: composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, enabling request inspection,
//! short-circuit responses, and response decoration without coupling route
//! handlers to infrastructure concerns. The innermost layer is always the
//! [`Router`].
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`Pipeline`]: an ordered middleware stack in front of a router.
//! - [`AccessLog`]: built-in request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};

use tracing::info;

use crate::{Request, Response, context::Context, router::Router};

/// A type-erased, reference-counted middleware.
pub type MiddlewareHandler = Arc<dyn Middleware>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] invokes the next middleware, or the router once the
/// chain is exhausted. It is consumed on each call, so a middleware can
/// forward a request at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
    router: Arc<Router>,
}

impl Next {
    /// Invokes the next layer in the chain and returns its response.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(middleware) => {
                self.index += 1;
                middleware.handle(ctx, self).await
            }
            None => self.router.dispatch(ctx).await,
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may pass the
/// request through, short-circuit with their own [`Response`], or decorate the
/// downstream response.
///
/// Implementations **should not** hold locks on shared state across an
/// `.await` point.
pub trait Middleware: Send + Sync + 'static {
    /// Handle the request and optionally delegate to the next layer.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// An ordered middleware stack in front of a [`Router`].
///
/// # Examples
///
/// ```rust,no_run
/// use promptgate::{Router, middleware::{AccessLog, Pipeline}};
///
/// let pipeline = Pipeline::new(Router::new()).with(AccessLog);
/// ```
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<[MiddlewareHandler]>,
    router: Arc<Router>,
}

impl Pipeline {
    /// Creates a pipeline with no middleware in front of `router`.
    pub fn new(router: Router) -> Self {
        Self {
            middlewares: Arc::from(Vec::new()),
            router: Arc::new(router),
        }
    }

    /// Appends a middleware; earlier middleware wrap later ones.
    #[must_use]
    pub fn with<M: Middleware>(self, middleware: M) -> Self {
        let mut middlewares: Vec<MiddlewareHandler> = self.middlewares.iter().cloned().collect();
        middlewares.push(Arc::new(middleware));
        Self {
            middlewares: middlewares.into(),
            router: self.router,
        }
    }

    /// Runs `request` through the middleware stack and the router.
    pub async fn handle(&self, request: Request) -> Response {
        let next = Next {
            middlewares: Arc::clone(&self.middlewares),
            index: 0,
            router: Arc::clone(&self.router),
        };
        next.run(Context::new(request)).await
    }
}

/// Logs each request on arrival and once its response head is ready.
///
/// For streamed and upgraded responses the completion line is written when
/// the handler returns, before the body is delivered.
pub struct AccessLog;

impl Middleware for AccessLog {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let method = ctx.request().method().as_str().to_owned();
            let path = ctx.request().path().to_owned();
            let received_at = ctx.received_at();
            info!(%method, %path, "request received");

            let response = next.run(ctx).await;

            info!(
                %method,
                %path,
                status = response.status().as_u16(),
                elapsed = ?received_at.elapsed(),
                "request handled"
            );
            response
        })
    }
}
