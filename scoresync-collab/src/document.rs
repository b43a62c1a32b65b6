//! The text buffer a collaboration session edits.
//!
//! The engine never owns editor widgets; it talks to whatever holds the
//! text through [`DocumentSink`]. [`TextDocument`] is a plain in-memory
//! implementation used by headless clients and tests.

use crate::operation::{byte_offset, Operation};

/// Owning text buffer of a collaborative document. Offsets are in chars.
pub trait DocumentSink {
    fn apply_insert(&mut self, start: usize, text: &str);
    fn apply_remove(&mut self, start: usize, len: usize);
    fn text(&self) -> String;
    /// Replace the whole content.
    fn set_text(&mut self, text: &str);
    fn cursor(&self) -> usize;
    fn set_cursor(&mut self, index: usize);
    fn set_read_only(&mut self, read_only: bool);

    /// Apply an operation, splitting multi-operations into their parts.
    fn apply(&mut self, op: &Operation) {
        match op {
            Operation::Insert { start, text, .. } => self.apply_insert(*start, text),
            Operation::Remove { start, len, .. } => self.apply_remove(*start, *len),
            Operation::Multi { operations } => {
                for op in operations {
                    self.apply(op);
                }
            }
        }
    }
}

/// In-memory document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextDocument {
    text: String,
    cursor: usize,
    read_only: bool,
}

impl TextDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cursor: 0,
            read_only: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

impl DocumentSink for TextDocument {
    fn apply_insert(&mut self, start: usize, text: &str) {
        let at = byte_offset(&self.text, start);
        self.text.insert_str(at, text);
    }

    fn apply_remove(&mut self, start: usize, len: usize) {
        let from = byte_offset(&self.text, start);
        let to = byte_offset(&self.text, start + len);
        self.text.replace_range(from..to, "");
        self.cursor = self.cursor.min(self.char_len());
    }

    fn text(&self) -> String {
        self.text.clone()
    }

    fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
        self.cursor = self.cursor.min(self.char_len());
    }

    fn cursor(&self) -> usize {
        self.cursor
    }

    fn set_cursor(&mut self, index: usize) {
        self.cursor = index.min(self.char_len());
    }

    fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }
}
