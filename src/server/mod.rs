//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function.
//! Supports persistent connections (including pipelined requests), chunked
//! streaming bodies and protocol upgrades.
//!
//! Every dispatched request carries a [`CancellationToken`]. It fires when
//! the client disconnects while the handler runs or a chunked body is
//! pending, when writing the response fails, and in any case once the
//! response is done. A client that half-closes its side after sending a
//! request counts as disconnected.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::http::{
    Body, ChunkStream, StatusCode,
    request::{Request, RequestError},
    response::{LAST_CHUNK, Response, encode_chunk},
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The gateway's HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function.
///
/// # Examples
///
/// ```rust,no_run
/// use promptgate::server::Server;
/// use promptgate::http::{Request, Response, StatusCode};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     }, CancellationToken::new()).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler receives a [`Request`] and must return a [`Future`] that
    /// resolves to a [`Response`]. The handler is wrapped in an [`Arc`] and
    /// shared across all spawned Tokio tasks, so it must be `Send + Sync + 'static`.
    ///
    /// Runs until `shutdown` fires. Open connections finish the request in
    /// flight and then close.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H, shutdown: CancellationToken) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "promptgate listening");

        loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler, shutdown).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }

        info!("server stopped accepting connections");
        Ok(())
    }
}

/// Reads more bytes into `buf`. Returns `Ok(false)` if the peer closed the
/// connection or shutdown was requested.
async fn fill(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    shutdown: &CancellationToken,
) -> io::Result<bool> {
    let read = tokio::select! {
        biased;
        () = shutdown.cancelled() => return Ok(false),
        read = stream.read_buf(buf) => read?,
    };
    Ok(read > 0)
}

async fn reject(stream: &mut TcpStream, status: StatusCode, message: String) -> io::Result<()> {
    let response = Response::text(status, message).keep_alive(false);
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, parsing one
/// request per iteration from whatever is already buffered before reading
/// more, until the peer closes the connection or signals `Connection: close`.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %peer_addr, "request head too large, sending 413");
                    reject(&mut stream, StatusCode::PayloadTooLarge, "Request entity too large".into()).await?;
                    break;
                }
                if !fill(&mut stream, &mut buf, &shutdown).await? {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                reject(&mut stream, StatusCode::BadRequest, format!("Bad Request: {e}")).await?;
                break;
            }
        };

        let content_length = match request.content_length() {
            Ok(length) => length,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                reject(&mut stream, StatusCode::BadRequest, format!("Bad Request: {e}")).await?;
                break;
            }
        };
        let total_needed = body_offset + content_length;
        if total_needed > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, content_length, "request too large, sending 413");
            reject(&mut stream, StatusCode::PayloadTooLarge, "Request entity too large".into()).await?;
            break;
        }

        // Wait for the full body to arrive.
        if buf.len() < total_needed {
            if !fill(&mut stream, &mut buf, &shutdown).await? {
                debug!(peer = %peer_addr, "connection closed mid-body");
                break;
            }
            continue;
        }

        let mut frame = buf.split_to(total_needed);
        let body = frame.split_off(body_offset).freeze();

        let cancel = CancellationToken::new();
        let _cancel_on_exit = cancel.clone().drop_guard();
        let request = request.with_body(body).with_cancellation(cancel.clone());
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let handling = handler(request);
        tokio::pin!(handling);
        let response = tokio::select! {
            response = &mut handling => response,
            () = closed(&mut stream, &mut buf) => {
                info!(peer = %peer_addr, "client disconnected, cancelling request");
                cancel.cancel();
                return Ok(());
            }
        };
        let keep_alive = keep_alive && response.is_keep_alive() && !shutdown.is_cancelled();
        let (head, body) = response.keep_alive(keep_alive).into_parts();

        if let Err(e) = stream.write_all(&head).await {
            cancel.cancel();
            return Err(e);
        }
        match body {
            Body::Empty => {}
            Body::Full(bytes) => stream.write_all(&bytes).await?,
            Body::Chunked(chunks) => match write_chunks(&mut stream, &mut buf, chunks, &cancel).await? {
                Streamed::Finished => {}
                Streamed::Failed => {
                    warn!(peer = %peer_addr, "streamed response aborted");
                    break;
                }
                Streamed::Disconnected => {
                    info!(peer = %peer_addr, "client disconnected mid-stream, cancelling request");
                    return Ok(());
                }
            },
            Body::Upgrade(on_upgrade) => {
                stream.flush().await?;
                debug!(peer = %peer_addr, "connection upgraded");
                on_upgrade(stream).await;
                return Ok(());
            }
        }
        stream.flush().await?;

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

/// How a chunked body ended.
enum Streamed {
    Finished,
    /// The body stream failed; no terminating chunk was written.
    Failed,
    Disconnected,
}

/// Writes a chunked body, watching the socket for a disconnect while the
/// next chunk is pending.
async fn write_chunks(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    mut chunks: ChunkStream,
    cancel: &CancellationToken,
) -> io::Result<Streamed> {
    loop {
        let chunk = tokio::select! {
            chunk = chunks.next() => chunk,
            () = closed(stream, buf) => {
                cancel.cancel();
                return Ok(Streamed::Disconnected);
            }
        };
        let data = match chunk {
            None => break,
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                warn!(error = %e, "chunked body failed");
                cancel.cancel();
                return Ok(Streamed::Failed);
            }
        };
        let framed = encode_chunk(&data);
        if framed.is_empty() {
            continue;
        }
        if let Err(e) = write_and_flush(stream, &framed).await {
            cancel.cancel();
            return Err(e);
        }
    }
    stream.write_all(LAST_CHUNK).await?;
    Ok(Streamed::Finished)
}

/// Resolves once the peer has closed the connection or it failed.
///
/// Bytes that arrive in the meantime are pipelined requests and are kept in
/// `buf`. Once `buf` is full the connection is no longer watched.
async fn closed(stream: &mut TcpStream, buf: &mut BytesMut) {
    loop {
        if buf.len() > MAX_REQUEST_SIZE {
            return std::future::pending().await;
        }
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn write_and_flush(stream: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    stream.write_all(data).await?;
    stream.flush().await
}
