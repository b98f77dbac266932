/*!
 * Run-scoped record of sentences confirmed written.
 */

use parking_lot::Mutex;
use std::collections::HashSet;

use crate::database::{LineRef, TranslatedLine};

#[derive(Debug, Default)]
pub struct WrittenLedger {
    written: Mutex<HashSet<(String, LineRef)>>,
}

impl WrittenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the translations whose sentences were already written
    pub fn unwritten(&self, book_id: &str, translations: Vec<TranslatedLine>) -> Vec<TranslatedLine> {
        let written = self.written.lock();
        translations
            .into_iter()
            .filter(|t| !written.contains(&(book_id.to_string(), t.line)))
            .collect()
    }

    pub fn mark_written(&self, book_id: &str, translations: &[TranslatedLine]) {
        let mut written = self.written.lock();
        written.extend(translations.iter().map(|t| (book_id.to_string(), t.line)));
    }

    pub fn len(&self) -> usize {
        self.written.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
