/*!
 * Sentence selection.
 *
 * Reads the untranslated sentences of the store once, at the start of a run,
 * and groups them by book. Nothing here writes to the store.
 */

use log::{debug, info};
use regex::Regex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::models::Sentence;
use super::schema;
use crate::errors::StoreError;

/// Untranslated sentences of one or more books, keyed and ordered by book id
pub type SentencesByBook = BTreeMap<String, Vec<Sentence>>;

/// Read-only view of the sentence store
pub struct SentenceStore {
    path: PathBuf,
    conn: Connection,
    has_books_table: bool,
}

impl SentenceStore {
    /// Open an existing store and verify its layout
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(StoreError::Schema(format!("store {:?} does not exist", path)));
        }

        info!("Opening sentence store at: {:?}", path);
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        schema::configure_reader(&conn)?;
        schema::verify_schema(&conn)?;
        let has_books_table = schema::table_exists(&conn, "books")?;

        Ok(Self {
            path,
            conn,
            has_books_table,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Select every sentence whose translation is missing or empty,
    /// ordered by book, paragraph and line
    pub fn untranslated(&self) -> Result<Vec<Sentence>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT book_id, para_id, line_id, source_text
            FROM sentences
            WHERE translated_text IS NULL OR translated_text = ''
            ORDER BY book_id, para_id, line_id
            "#,
        )?;

        let sentences = stmt
            .query_map([], |row| {
                Ok(Sentence::new(
                    row.get::<_, String>(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Selected {} untranslated sentence(s)", sentences.len());
        Ok(sentences)
    }

    /// Untranslated sentences grouped by book, optionally restricted to books
    /// whose id matches `filter`
    pub fn untranslated_by_book(&self, filter: Option<&Regex>) -> Result<SentencesByBook, StoreError> {
        Ok(group_by_book(self.untranslated()?, filter))
    }

    /// Reference id of a book, used to look up auxiliary context.
    ///
    /// Falls back to the book id when the store has no `books` table or the
    /// book has no reference.
    pub fn book_ref(&self, book_id: &str) -> Result<String, StoreError> {
        if !self.has_books_table {
            return Ok(book_id.to_string());
        }

        let ref_id: Option<Option<String>> = self
            .conn
            .query_row("SELECT ref_id FROM books WHERE book_id = ?1", [book_id], |row| row.get(0))
            .optional()?;

        Ok(ref_id
            .flatten()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| book_id.to_string()))
    }
}

/// Group an ordered sentence list by book, keeping per-book order
pub fn group_by_book(sentences: Vec<Sentence>, filter: Option<&Regex>) -> SentencesByBook {
    let mut books = SentencesByBook::new();
    for sentence in sentences {
        if filter.is_some_and(|f| !f.is_match(&sentence.book_id)) {
            continue;
        }
        books.entry(sentence.book_id.clone()).or_default().push(sentence);
    }
    books
}
