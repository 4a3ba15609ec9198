//! HTTP header map with case-insensitive name lookup.
//!
//! HTTP headers are order-preserving and case-insensitive per [RFC 9110 §5].

/// A case-insensitive, multi-value HTTP header map.
///
/// Preserves insertion order and allows repeated names, which is all a
/// request/response pair on this gateway needs.
///
/// # Examples
///
/// ```
/// use promptgate::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Connection", "keep-alive, Upgrade");
/// headers.insert("Upgrade", "websocket");
///
/// assert!(headers.has_token("connection", "upgrade"));
/// assert_eq!(headers.get("UPGRADE"), Some("websocket"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if any value of `name` contains `token` as one of its
    /// comma-separated elements (case-insensitive), as used by `Connection`
    /// and `Upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.inner
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|element| element.trim().eq_ignore_ascii_case(token))
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn token_lists_are_split_and_trimmed() {
        let mut h = Headers::new();
        h.insert("Connection", "keep-alive,  Upgrade ");
        assert!(h.has_token("connection", "upgrade"));
        assert!(h.has_token("Connection", "KEEP-ALIVE"));
        assert!(!h.has_token("connection", "close"));
    }

    #[test]
    fn token_lookup_spans_repeated_headers() {
        let mut h = Headers::new();
        h.insert("Connection", "keep-alive");
        h.insert("connection", "upgrade");
        assert!(h.has_token("connection", "upgrade"));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn contains() {
        let mut h = Headers::new();
        h.insert("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        assert!(h.contains("sec-websocket-key"));
        assert!(!h.contains("x-missing"));
        assert!(!h.is_empty());
    }
}
