//! Minimum-size regrouping of provider fragments into output chunks.

/// Accumulates fragments until at least `min_size` characters are pending.
///
/// A `min_size` of zero disables batching: every non-empty fragment is its
/// own chunk.
///
/// ```
/// use promptgate::llm::chunker::ChunkBuffer;
///
/// let mut buffer = ChunkBuffer::new(5);
/// assert_eq!(buffer.push("ab"), None);
/// assert_eq!(buffer.push("cde").as_deref(), Some("abcde"));
/// assert_eq!(buffer.push("f"), None);
/// assert_eq!(buffer.finish().as_deref(), Some("f"));
/// ```
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    min_size: usize,
    pending: String,
    pending_chars: usize,
}

impl ChunkBuffer {
    pub fn new(min_size: usize) -> Self {
        Self {
            min_size,
            pending: String::new(),
            pending_chars: 0,
        }
    }

    /// Adds a fragment, returning a chunk once the threshold is reached.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        if fragment.is_empty() {
            return None;
        }
        if self.min_size == 0 {
            return Some(fragment.to_owned());
        }

        self.pending.push_str(fragment);
        self.pending_chars += fragment.chars().count();
        if self.pending_chars < self.min_size {
            return None;
        }
        self.pending_chars = 0;
        Some(std::mem::take(&mut self.pending))
    }

    /// Flushes whatever is left once the provider is done.
    pub fn finish(&mut self) -> Option<String> {
        self.pending_chars = 0;
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}
