/*!
 * Chunk scheduler.
 *
 * Packs an ordered sentence list into batches of bounded text size. Batches
 * never span two books, keep the input order, and cover every sentence
 * exactly once. A sentence larger than the bound forms a batch of its own.
 */

use serde::Serialize;

use crate::database::{LineRef, Sentence};

/// Size of a text as counted against the batch bound
pub fn text_size(text: &str) -> usize {
    text.chars().count()
}

/// A sentence as carried inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchLine {
    pub line: LineRef,
    pub source_text: String,
}

/// A group of consecutive sentences sent together in one call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    /// 1-based position in the schedule
    pub batch_id: usize,
    pub book_id: String,
    pub lines: Vec<BatchLine>,
    /// Sum of the text sizes of all lines
    pub total_size: usize,
}

impl Batch {
    fn new(batch_id: usize, book_id: &str) -> Self {
        Self {
            batch_id,
            book_id: book_id.to_string(),
            lines: Vec::new(),
            total_size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Identities of the batch's sentences, in order
    pub fn line_refs(&self) -> Vec<LineRef> {
        self.lines.iter().map(|l| l.line).collect()
    }

    fn push(&mut self, sentence: &Sentence, size: usize) {
        self.lines.push(BatchLine {
            line: sentence.line,
            source_text: sentence.source_text.clone(),
        });
        self.total_size += size;
    }
}

/// Greedy packer with a maximum batch size
#[derive(Debug, Clone, Copy)]
pub struct ChunkScheduler {
    max_chunk_chars: usize,
}

impl ChunkScheduler {
    pub fn new(max_chunk_chars: usize) -> Self {
        Self { max_chunk_chars }
    }

    pub fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    /// Partition `sentences` into batches
    ///
    /// A batch is closed when the next sentence would push it over the bound
    /// or belongs to a different book.
    pub fn schedule(&self, sentences: &[Sentence]) -> Vec<Batch> {
        let mut batches = Vec::new();
        let mut current: Option<Batch> = None;

        for sentence in sentences {
            let size = text_size(&sentence.source_text);

            let must_close = current.as_ref().is_some_and(|batch| {
                batch.book_id != sentence.book_id || batch.total_size + size > self.max_chunk_chars
            });
            if must_close {
                batches.extend(current.take());
            }

            current
                .get_or_insert_with(|| Batch::new(batches.len() + 1, &sentence.book_id))
                .push(sentence, size);
        }

        batches.extend(current);
        batches
    }
}
