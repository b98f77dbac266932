/*!
 * Store entity models.
 *
 * These structures map directly to rows of the sentence store and carry
 * translated lines from the workers to the persistence writer.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a sentence within its book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineRef {
    /// Paragraph number within the book
    pub para_id: i64,
    /// Line number within the paragraph
    pub line_id: i64,
}

impl LineRef {
    pub fn new(para_id: i64, line_id: i64) -> Self {
        Self { para_id, line_id }
    }
}

impl fmt::Display for LineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.para_id, self.line_id)
    }
}

/// A source sentence as selected from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    /// Book the sentence belongs to
    pub book_id: String,
    /// Position within the book
    pub line: LineRef,
    /// Source text to translate
    pub source_text: String,
}

impl Sentence {
    pub fn new(book_id: impl Into<String>, para_id: i64, line_id: i64, source_text: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            line: LineRef::new(para_id, line_id),
            source_text: source_text.into(),
        }
    }
}

/// A validated translation ready to be persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedLine {
    pub line: LineRef,
    pub source_text: String,
    pub translated_text: String,
}
