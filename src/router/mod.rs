//! Request routing. Maps HTTP methods and literal paths to handler functions.
//!
//! The gateway exposes a small, fixed set of endpoints, so [`Router`] matches
//! literal paths only. Trailing slashes are normalized on both registered
//! paths and incoming paths, so `/api/queries/` and `/api/queries` are the
//! same route.
//!
//! When no route matches the path a `404 Not Found` is produced; when the path
//! is known but not for the request's method, `405 Method Not Allowed`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::{Method, Response, StatusCode};

/// Type-erased, heap-allocated async handler that processes a [`Context`] and returns a
/// [`Response`].
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be cloned and shared across
/// connection tasks without copying the underlying closure. Use [`Router::get`] and
/// [`Router::post`] rather than building one by hand.
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket impl
/// below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

// Strip a trailing slash, except from the root path.
fn normalize(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

// A single registered route binding a method + path to a handler.
struct Route {
    method: Method,
    path: String,
    handler: Handler,
}

/// HTTP request router that dispatches requests to registered handler functions.
///
/// Routes are evaluated in registration order; the first route whose method and path
/// both match is used.
///
/// # Examples
///
/// ```rust,no_run
/// use promptgate::{Router, Response, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/api/template", |_ctx| async { Response::new(StatusCode::NoContent) });
/// ```
pub struct Router {
    routes: Vec<Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a handler for `GET` requests to `path`.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    /// Register a handler for `POST` requests to `path`.
    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Post, path, handler);
    }

    // Erase the concrete handler type and store it as a `Handler` trait object.
    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            method,
            path: normalize(path).to_owned(),
            handler,
        });
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch `ctx` to the first matching route and return its response.
    ///
    /// # Returns
    ///
    /// The handler's [`Response`], `405 Method Not Allowed` when only the path
    /// matched, or `404 Not Found` when nothing did.
    pub async fn dispatch(&self, ctx: Context) -> Response {
        let path = normalize(ctx.request().path());
        let method = ctx.request().method();

        let mut path_known = false;
        let mut handler = None;
        for route in &self.routes {
            if route.path != path {
                continue;
            }
            path_known = true;
            if &route.method == method {
                handler = Some(Arc::clone(&route.handler));
                break;
            }
        }

        match handler {
            Some(handler) => handler(ctx).await,
            None if path_known => Response::new(StatusCode::MethodNotAllowed),
            None => Response::new(StatusCode::NotFound),
        }
    }
}
