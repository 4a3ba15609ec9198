//! Server-Sent Events decoding for streamed provider responses.
//!
//! Only `data:` fields matter to completion streams. Comments, event names,
//! blank separator lines and the `[DONE]` sentinel are filtered out here so
//! callers receive nothing but JSON payloads.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream};

use super::provider::ProviderError;

const DONE_MARKER: &str = "[DONE]";

/// Splits a response body into SSE `data` payloads.
///
/// A read error from the body is yielded once and ends the stream. Any line
/// left unterminated when the body ends is still decoded.
pub fn data_lines<S, E>(body: S) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<ProviderError> + Send + 'static,
{
    let body = body.boxed();
    stream::unfold(
        (body, BytesMut::with_capacity(8192), false),
        |(mut body, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line = buffer.split_to(newline + 1);
                    match extract_data(&line) {
                        Some(Payload::Data(data)) => return Some((Ok(data), (body, buffer, false))),
                        Some(Payload::Done) => return None,
                        None => continue,
                    }
                }

                match body.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(err)) => return Some((Err(err.into()), (body, buffer, true))),
                    None => {
                        let rest = buffer.split();
                        return match extract_data(&rest) {
                            Some(Payload::Data(data)) => Some((Ok(data), (body, buffer, true))),
                            _ => None,
                        };
                    }
                }
            }
        },
    )
}

enum Payload {
    Data(String),
    Done,
}

fn extract_data(line: &[u8]) -> Option<Payload> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim_start();
    if data == DONE_MARKER {
        return Some(Payload::Done);
    }
    if data.is_empty() {
        return None;
    }
    Some(Payload::Data(data.to_owned()))
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    impl From<Infallible> for ProviderError {
        fn from(never: Infallible) -> Self {
            match never {}
        }
    }

    async fn decode(parts: &[&'static str]) -> Vec<String> {
        let body = stream::iter(
            parts
                .iter()
                .copied()
                .map(|p| Ok::<_, Infallible>(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        );
        data_lines(body).map(|line| line.unwrap()).collect().await
    }

    #[tokio::test]
    async fn reassembles_lines_split_across_chunks() {
        let lines = decode(&["data: {\"a\"", ":1}\n\ndata: {\"b\":2}\r\n", "\n"]).await;
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[tokio::test]
    async fn skips_comments_and_other_fields() {
        let lines = decode(&[": keep-alive\nevent: message\nid: 7\ndata: x\n\n"]).await;
        assert_eq!(lines, vec!["x"]);
    }

    #[tokio::test]
    async fn stops_at_done_marker() {
        let lines = decode(&["data: one\n\ndata: [DONE]\n\ndata: after\n\n"]).await;
        assert_eq!(lines, vec!["one"]);
    }

    #[tokio::test]
    async fn decodes_trailing_line_without_newline() {
        let lines = decode(&["data: first\n", "data: last"]).await;
        assert_eq!(lines, vec!["first", "last"]);
    }

    #[tokio::test]
    async fn body_error_is_reported_once() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"data: ok\n")),
            Err(ProviderError::Stream("reset".into())),
            Ok(Bytes::from_static(b"data: unreachable\n")),
        ]);
        let items: Vec<_> = data_lines(body).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "ok");
        assert!(matches!(items[1], Err(ProviderError::Stream(_))));
    }
}
