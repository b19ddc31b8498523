//! Buffering of remote text fragments into readable lines.

/// Concatenates text fragments until a word boundary or a length limit.
///
/// A fragment that ends in whitespace completes the buffer, as does the
/// buffer reaching `limit` characters. Emitted text is trimmed and never
/// empty.
#[derive(Debug)]
pub struct TextAccumulator {
    buf: String,
    limit: usize,
}

impl TextAccumulator {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit: limit.max(1),
        }
    }

    /// Add a fragment, returning the completed text if a flush triggered.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.buf.push_str(fragment);

        let boundary = fragment.chars().last().is_some_and(char::is_whitespace);
        if boundary || self.buf.chars().count() >= self.limit {
            self.flush()
        } else {
            None
        }
    }

    /// Empty the buffer, returning its trimmed content unless blank.
    pub fn flush(&mut self) -> Option<String> {
        let text = self.buf.trim().to_string();
        self.buf.clear();
        if text.is_empty() { None } else { Some(text) }
    }
}
