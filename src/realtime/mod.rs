//! WebSocket support: the RFC 6455 opening handshake on top of the HTTP
//! server, and a few helpers for reading and closing sockets.
//!
//! [`upgrade`] validates the handshake and returns a `101 Switching
//! Protocols` response. Once the server has written that response it hands
//! the raw TCP stream to the session closure as a [`WebSocket`].

use std::future::Future;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{
    self, Message,
    handshake::derive_accept_key,
    protocol::{CloseFrame, Role, frame::coding::CloseCode},
};
use tracing::debug;

use crate::http::{OnUpgrade, Request, Response};

/// A server-side socket over an upgraded connection.
pub type WebSocket = WebSocketStream<TcpStream>;

/// Close reasons are limited to 123 bytes by the frame format.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("request is not a websocket upgrade")]
    NotUpgrade,

    #[error("unsupported websocket version {0:?}, expected 13")]
    UnsupportedVersion(Option<String>),

    #[error("websocket protocol error: {0}")]
    Protocol(#[from] tungstenite::Error),

    #[error("binary message is not valid UTF-8")]
    InvalidUtf8,
}

/// Accepts a WebSocket handshake and schedules `session` to run on the
/// upgraded connection.
///
/// # Errors
///
/// [`WsError::NotUpgrade`] or [`WsError::UnsupportedVersion`] when the
/// request is not a valid version 13 handshake.
pub fn upgrade<F, Fut>(request: &Request, session: F) -> Result<Response, WsError>
where
    F: FnOnce(WebSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if !request.is_websocket_upgrade() {
        return Err(WsError::NotUpgrade);
    }
    let version = request.headers().get("sec-websocket-version").map(str::trim);
    if version != Some("13") {
        return Err(WsError::UnsupportedVersion(version.map(str::to_owned)));
    }
    let key = request
        .headers()
        .get("sec-websocket-key")
        .ok_or(WsError::NotUpgrade)?;
    let accept = derive_accept_key(key.trim().as_bytes());

    let on_upgrade: OnUpgrade = Box::new(move |stream: TcpStream| {
        Box::pin(async move {
            let socket = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
            session(socket).await;
        })
    });
    Ok(Response::upgrade("websocket", on_upgrade).header("Sec-WebSocket-Accept", accept))
}

/// Waits for the next data message and returns its text.
///
/// Control frames are skipped; binary payloads must be UTF-8. Returns
/// `Ok(None)` once the peer closes or the connection ends.
///
/// # Errors
///
/// [`WsError::Protocol`] for transport failures, [`WsError::InvalidUtf8`]
/// for a non-UTF-8 binary message.
pub async fn receive_text<S>(incoming: &mut S) -> Result<Option<String>, WsError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = incoming.next().await {
        match message? {
            Message::Text(text) => {
                debug!(bytes = text.as_str().len(), "websocket text received");
                return Ok(Some(text.as_str().to_owned()));
            }
            Message::Binary(data) => {
                debug!(bytes = data.len(), "websocket binary received");
                let text = String::from_utf8(data.to_vec()).map_err(|_| WsError::InvalidUtf8)?;
                return Ok(Some(text));
            }
            Message::Close(_) => return Ok(None),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Ok(None)
}

/// Builds a close message, truncating `reason` on a character boundary.
pub fn close_message(code: CloseCode, reason: &str) -> Message {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    Message::Close(Some(CloseFrame {
        code,
        reason: reason[..end].to_owned().into(),
    }))
}
