//! Transport adapters: each handler drives one [`RelayStream`] into one
//! response shape.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt, stream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::App;
use crate::context::Context;
use crate::llm::{RelayError, RelayState};
use crate::realtime::{self, WebSocket};
use crate::{Response, StatusCode};

/// Maps a relay error to the HTTP status the client sees.
pub fn status_for(err: &RelayError) -> StatusCode {
    match err {
        RelayError::QuotaExceeded => StatusCode::TooManyRequests,
        RelayError::TemplateMismatch { .. } | RelayError::PromptTooLong { .. } => {
            StatusCode::BadRequest
        }
        RelayError::Configuration(_) | RelayError::MissingCredential(_) => {
            StatusCode::ServiceUnavailable
        }
        RelayError::Provider(_) => StatusCode::BadGateway,
        RelayError::Cancelled => StatusCode::InternalServerError,
    }
}

/// Maps a relay error to a WebSocket close code.
pub fn close_code_for(err: &RelayError) -> CloseCode {
    if err.is_validation() || matches!(err, RelayError::QuotaExceeded) {
        CloseCode::Unsupported
    } else {
        CloseCode::Error
    }
}

fn log_failure(err: &RelayError) {
    match err {
        RelayError::Cancelled => info!("request cancelled by client"),
        RelayError::Provider(_) => error!(error = %err, "completion failed"),
        _ if err.is_validation() => warn!(error = %err, "request rejected"),
        _ => info!(error = %err, "request rejected"),
    }
}

/// Logs `err` and renders it as a plain-text error response.
pub fn error_response(err: &RelayError) -> Response {
    log_failure(err);
    Response::text(status_for(err), err.to_string())
}

fn bad_request(message: impl Into<String>) -> Response {
    Response::text(StatusCode::BadRequest, message)
}

fn body_queries(ctx: &Context) -> Result<Vec<String>, Response> {
    ctx.json::<Vec<String>>()
        .map_err(|e| bad_request(format!("expected a JSON array of strings: {e}")))
}

fn url_query(ctx: &Context) -> Result<Vec<String>, Response> {
    ctx.query("query")
        .map(|query| vec![query.to_owned()])
        .ok_or_else(|| bad_request("missing `query` parameter"))
}

async fn aggregate(app: &App, ctx: &Context, queries: Vec<String>) -> Response {
    let relay = match app.start(&queries, ctx.cancellation()) {
        Ok(relay) => relay,
        Err(e) => return error_response(&e),
    };
    match relay.collect_text().await {
        Ok(text) => Response::text(StatusCode::Ok, text),
        Err(e) => error_response(&e),
    }
}

/// Streams the relay as a chunked body.
///
/// The first chunk is awaited before the response head exists, so failures
/// before any output still produce a proper status. Later failures abort the
/// body.
async fn chunked(app: &App, ctx: &Context, queries: Vec<String>) -> Response {
    let mut relay = match app.start(&queries, ctx.cancellation()) {
        Ok(relay) => relay,
        Err(e) => return error_response(&e),
    };

    let first = match relay.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(e)) => return error_response(&e),
        None if relay.state() == RelayState::Cancelled => {
            return error_response(&RelayError::Cancelled);
        }
        None => None,
    };

    let body = stream::iter(first.map(Ok))
        .chain(relay)
        .map(|chunk| chunk.map(Bytes::from).map_err(io::Error::other));
    Response::chunked(StatusCode::Ok, Box::pin(body))
}

pub(super) async fn post_queries(app: Arc<App>, ctx: Context) -> Response {
    info!("request received at /api/queries");
    match body_queries(&ctx) {
        Ok(queries) => aggregate(&app, &ctx, queries).await,
        Err(response) => response,
    }
}

pub(super) async fn get_query(app: Arc<App>, ctx: Context) -> Response {
    info!("request received at /api/query");
    match url_query(&ctx) {
        Ok(queries) => aggregate(&app, &ctx, queries).await,
        Err(response) => response,
    }
}

pub(super) async fn post_queries_stream(app: Arc<App>, ctx: Context) -> Response {
    info!("request received at /api/queries/stream");
    match body_queries(&ctx) {
        Ok(queries) => chunked(&app, &ctx, queries).await,
        Err(response) => response,
    }
}

pub(super) async fn get_query_stream(app: Arc<App>, ctx: Context) -> Response {
    info!("request received at /api/query/stream");
    match url_query(&ctx) {
        Ok(queries) => chunked(&app, &ctx, queries).await,
        Err(response) => response,
    }
}

pub(super) async fn queries_socket(app: Arc<App>, ctx: Context) -> Response {
    info!("request received at /api/queries/ws");
    accept_socket(app, &ctx, None)
}

pub(super) async fn query_socket(app: Arc<App>, ctx: Context) -> Response {
    info!("request received at /api/query/ws");
    match url_query(&ctx) {
        Ok(queries) => accept_socket(app, &ctx, Some(queries)),
        Err(response) => response,
    }
}

pub(super) async fn template(app: Arc<App>, _ctx: Context) -> Response {
    info!("request received at /api/template");
    match app.frontend_template() {
        Some(template) => Response::text(StatusCode::Ok, template),
        None => Response::new(StatusCode::NoContent),
    }
}

fn accept_socket(app: Arc<App>, ctx: &Context, queries: Option<Vec<String>>) -> Response {
    match realtime::upgrade(ctx.request(), move |socket| socket_session(app, socket, queries)) {
        Ok(response) => response,
        Err(e) => bad_request(e.to_string()),
    }
}

/// Relays one completion over a socket.
///
/// Without URL queries, the first message must carry them as a JSON array.
/// Each chunk becomes one text frame. The relay is cancelled as soon as the
/// client closes or the connection drops.
async fn socket_session(app: Arc<App>, socket: WebSocket, queries: Option<Vec<String>>) {
    let (mut sink, mut incoming) = socket.split();

    let queries = match queries {
        Some(queries) => queries,
        None => match realtime::receive_text(&mut incoming).await {
            Ok(Some(text)) => match serde_json::from_str::<Vec<String>>(&text) {
                Ok(queries) => queries,
                Err(e) => {
                    let reason = format!("expected a JSON array of strings: {e}");
                    warn!(error = %e, "malformed websocket query message");
                    let _ = sink.send(realtime::close_message(CloseCode::Unsupported, &reason)).await;
                    return;
                }
            },
            Ok(None) => {
                debug!("websocket closed before queries arrived");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read websocket query message");
                let _ = sink
                    .send(realtime::close_message(CloseCode::Unsupported, &e.to_string()))
                    .await;
                return;
            }
        },
    };

    let cancel = CancellationToken::new();
    let _cancel_on_exit = cancel.clone().drop_guard();
    let mut relay = match app.start(&queries, cancel.clone()) {
        Ok(relay) => relay,
        Err(e) => {
            log_failure(&e);
            let _ = sink.send(realtime::close_message(close_code_for(&e), &e.to_string())).await;
            return;
        }
    };

    loop {
        tokio::select! {
            chunk = relay.next() => match chunk {
                Some(Ok(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(error = %e, "websocket send failed, cancelling relay");
                        cancel.cancel();
                        return;
                    }
                }
                Some(Err(e)) => {
                    log_failure(&e);
                    let _ = sink.send(realtime::close_message(close_code_for(&e), &e.to_string())).await;
                    return;
                }
                None => {
                    if relay.state() == RelayState::Completed {
                        let _ = sink.send(realtime::close_message(CloseCode::Normal, "completed")).await;
                    }
                    return;
                }
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_)) | Err(_)) | None => {
                    info!("websocket closed by client, cancelling relay");
                    cancel.cancel();
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}
