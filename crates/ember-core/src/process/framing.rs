//! Message framing over line-oriented worker output.
//!
//! A logical message is one or more physical lines; the last one ends with a
//! NUL character right before the line terminator.

/// Marks the last line of a message.
pub const MESSAGE_TERMINATOR: char = '\0';

/// Accumulates physical lines until a NUL-terminated line completes a message.
#[derive(Debug, Default)]
pub struct MessageFramer {
    buffer: String,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one physical line (without its `\n`).
    ///
    /// Returns the completed message when the line carries the terminator.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        match line.strip_suffix(MESSAGE_TERMINATOR) {
            Some(last) => {
                self.buffer.push_str(last);
                Some(std::mem::take(&mut self.buffer))
            }
            None => {
                self.buffer.push_str(line);
                self.buffer.push('\n');
                None
            }
        }
    }

    /// Whether a partial message is buffered.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Take whatever is buffered, used when the stream closes mid-message.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut text = std::mem::take(&mut self.buffer);
        if text.ends_with('\n') {
            text.pop();
        }
        Some(text)
    }
}
