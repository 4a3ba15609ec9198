//! HTTP/1.1 request parsing using the [`httparse`] crate.

use std::collections::HashMap;

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },
}

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from the head of a raw byte buffer; the
/// server attaches the body with [`Request::with_body`] once all of it has
/// arrived, and a per-request [`CancellationToken`] with
/// [`Request::with_cancellation`].
///
/// # Examples
///
/// ```
/// use promptgate::http::request::Request;
///
/// let raw = b"GET /api/query?query=hello+there HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/api/query");
/// assert_eq!(request.query_param("query"), Some("hello there"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    params: HashMap<String, String>,
    cancel: CancellationToken,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parse the head of a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` (with an empty body) and the byte offset
    /// at which the body begins in `buf` (immediately after `\r\n\r\n`).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let params = query.as_deref().map(parse_query_string).unwrap_or_default();

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                body: Bytes::new(),
                params,
                cancel: CancellationToken::new(),
            },
            body_offset,
        ))
    }

    /// Attaches the request body.
    #[must_use]
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Attaches the cancellation signal that fires when the client goes away.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a decoded query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the per-request cancellation signal.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        self.version == 1 || self.headers.has_token("connection", "keep-alive")
    }

    /// Returns the `Content-Length` of the body, `0` when absent.
    ///
    /// # Errors
    ///
    /// [`RequestError::InvalidContentLength`] when the header is not a number.
    pub fn content_length(&self) -> Result<usize, RequestError> {
        match self.headers.get("content-length") {
            None => Ok(0),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| RequestError::InvalidContentLength {
                    value: value.to_owned(),
                }),
        }
    }

    /// Returns `true` for an RFC 6455 opening handshake.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == Method::Get
            && self.headers.has_token("connection", "upgrade")
            && self.headers.has_token("upgrade", "websocket")
            && self.headers.contains("sec-websocket-key")
    }
}

/// Parses a URL query string (`key=value&key2=value2`) into a `HashMap`.
///
/// `+` is decoded as a space before percent-decoding; invalid UTF-8 is
/// replaced rather than rejected.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET /api/template HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.path(), "/api/template");
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
        assert!(req.body().is_empty());
    }

    #[test]
    fn query_values_are_percent_decoded() {
        let raw = b"GET /api/query?query=caf%C3%A9+au+lait&x= HTTP/1.1\r\nHost: h\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.query_param("query"), Some("café au lait"));
        assert_eq!(req.query_param("x"), Some(""));
        assert_eq!(req.query_string(), Some("query=caf%C3%A9+au+lait&x="));
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn keep_alive_rules() {
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert!(req.is_keep_alive());

        let (req, _) =
            Request::parse(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());

        let (req, _) = Request::parse(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn body_is_attached_separately() {
        let raw = b"POST /api/queries HTTP/1.1\r\nContent-Length: 7\r\n\r\n[\"a\"]\r\n";
        let (req, body_offset) = Request::parse(raw).unwrap();
        assert_eq!(req.content_length().unwrap(), 7);
        assert!(req.body().is_empty());

        let req = req.with_body(Bytes::copy_from_slice(&raw[body_offset..]));
        assert_eq!(req.body().as_ref(), b"[\"a\"]\r\n");
    }

    #[test]
    fn bad_content_length_is_an_error() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(matches!(
            req.content_length(),
            Err(RequestError::InvalidContentLength { .. })
        ));
    }

    #[test]
    fn detects_websocket_handshake() {
        let raw = b"GET /api/queries/ws HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\n\
Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(req.is_websocket_upgrade());

        let (plain, _) = Request::parse(b"GET /api/queries/ws HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert!(!plain.is_websocket_upgrade());
    }

    #[test]
    fn cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let req = req.with_cancellation(token.clone());
        token.cancel();
        assert!(req.cancellation().is_cancelled());
    }
}
