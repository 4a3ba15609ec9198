//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing responses and serializing
//! them for transmission over TCP. Besides ordinary fixed-length bodies a
//! response may carry a lazily produced chunked body or hand the connection
//! over to an upgrade callback (used for WebSockets).

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use tokio::net::TcpStream;

use super::{Headers, StatusCode};

/// The terminating zero-length chunk of a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Lazily produced body pieces, written with `Transfer-Encoding: chunked`.
///
/// An `Err` item aborts the response: the connection is closed without the
/// terminating chunk so the client can tell the body is incomplete.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Takes ownership of the connection after a `101 Switching Protocols` head
/// has been written.
pub type OnUpgrade = Box<dyn FnOnce(TcpStream) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Response payload.
pub enum Body {
    Empty,
    Full(Vec<u8>),
    Chunked(ChunkStream),
    Upgrade(OnUpgrade),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Chunked(_) => f.write_str("Chunked(..)"),
            Self::Upgrade(_) => f.write_str("Upgrade(..)"),
        }
    }
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use promptgate::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
            keep_alive: true,
        }
    }

    /// Creates a `text/plain` response.
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(text)
    }

    /// Creates a chunked `text/plain` response whose body is produced by `chunks`.
    pub fn chunked(status: StatusCode, chunks: ChunkStream) -> Self {
        let mut response =
            Self::new(status).header("Content-Type", "text/plain; charset=utf-8");
        response.body = Body::Chunked(chunks);
        response
    }

    /// Creates a `101 Switching Protocols` response that hands the connection
    /// to `on_upgrade` once the head is on the wire.
    pub fn upgrade(protocol: &str, on_upgrade: OnUpgrade) -> Self {
        let mut response = Self::new(StatusCode::SwitchingProtocols)
            .header("Upgrade", protocol)
            .header("Connection", "Upgrade");
        response.body = Body::Upgrade(on_upgrade);
        response
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a fixed-length body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(body.into().into_bytes());
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns `false` if the connection must be closed after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the body.
    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    /// Consumes the response, returning the body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Splits the response into its serialized head and its body.
    ///
    /// The framing headers depend on the body kind:
    /// - fixed bodies get `Content-Length` (a default `Content-Type` when non-empty)
    /// - chunked bodies get `Transfer-Encoding: chunked`
    /// - upgrades keep the headers given to [`Response::upgrade`] untouched
    pub fn into_parts(mut self) -> (BytesMut, Body) {
        match &self.body {
            Body::Upgrade(_) => {}
            Body::Empty | Body::Full(_) | Body::Chunked(_) => {
                let connection = if self.keep_alive { "keep-alive" } else { "close" };
                self.headers.insert("Connection", connection);
            }
        }

        match &self.body {
            Body::Empty => self.headers.insert("Content-Length", "0"),
            Body::Full(bytes) => {
                if !self.headers.contains("content-type") {
                    self.headers
                        .insert("Content-Type", "text/plain; charset=utf-8");
                }
                self.headers.insert("Content-Length", bytes.len().to_string());
            }
            Body::Chunked(_) => self.headers.insert("Transfer-Encoding", "chunked"),
            Body::Upgrade(_) => {}
        }

        let mut head = BytesMut::with_capacity(128 + self.headers.len() * 64);
        head.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            head.put(format!("{name}: {value}\r\n").as_bytes());
        }
        head.put(&b"\r\n"[..]);

        (head, self.body)
    }

    /// Serializes a fixed-length response into a single buffer.
    ///
    /// Chunked and upgrade bodies cannot be flattened; only their head is returned.
    pub fn into_bytes(self) -> BytesMut {
        let (mut head, body) = self.into_parts();
        if let Body::Full(bytes) = body {
            head.put(bytes.as_slice());
        }
        head
    }
}

/// Frames one piece of a chunked body: hex length, CRLF, data, CRLF.
///
/// Empty input produces an empty buffer, since a zero-length chunk would
/// terminate the body.
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(data.len() + 12);
    if data.is_empty() {
        return buf;
    }
    buf.put(format!("{:X}\r\n", data.len()).as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    buf
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
