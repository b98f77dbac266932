/*!
 * Auxiliary paragraph context.
 *
 * Context is optional reference material appended to a prompt. A lookup that
 * fails is logged and treated as absent; it never blocks encoding.
 */

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use super::codec::ParagraphContext;
use super::scheduler::Batch;
use crate::errors::StoreError;

/// Source of per-paragraph reference text
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Context for one paragraph of a book, if any
    async fn paragraph_context(&self, book_ref: &str, para_id: i64) -> Option<String>;
}

/// Source used when no context database is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

#[async_trait]
impl ContextSource for NoContext {
    async fn paragraph_context(&self, _book_ref: &str, _para_id: i64) -> Option<String> {
        None
    }
}

/// Reads `paragraph_context(book_ref, para_id, position, content)` rows from
/// a separate SQLite file
#[derive(Clone)]
pub struct SqliteContextSource {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteContextSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Opening context database at: {:?}", path);

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            connection: Arc::new(Mutex::new(conn)),
        }
    }

    fn lookup(conn: &Connection, book_ref: &str, para_id: i64) -> Result<Option<String>, rusqlite::Error> {
        let mut stmt = conn.prepare_cached(
            "SELECT content FROM paragraph_context WHERE book_ref = ?1 AND para_id = ?2 ORDER BY position",
        )?;
        let parts = stmt
            .query_map(rusqlite::params![book_ref, para_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        if parts.is_empty() {
            return Ok(None);
        }
        Ok(Some(parts.join("\n")))
    }
}

#[async_trait]
impl ContextSource for SqliteContextSource {
    async fn paragraph_context(&self, book_ref: &str, para_id: i64) -> Option<String> {
        let conn = self.connection.clone();
        let book = book_ref.to_string();

        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            Self::lookup(&conn, &book, para_id)
        })
        .await;

        match result {
            Ok(Ok(context)) => context,
            Ok(Err(e)) => {
                warn!("Context lookup failed for {} paragraph {}: {}", book_ref, para_id, e);
                None
            }
            Err(e) => {
                warn!("Context lookup task failed for {} paragraph {}: {}", book_ref, para_id, e);
                None
            }
        }
    }
}

/// Gather the context of every distinct paragraph of a batch, in paragraph order
pub async fn collect_context(source: &dyn ContextSource, book_ref: &str, batch: &Batch) -> Vec<ParagraphContext> {
    let paragraphs: BTreeSet<i64> = batch.lines.iter().map(|l| l.line.para_id).collect();

    let mut contexts = Vec::new();
    for para_id in paragraphs {
        if let Some(text) = source.paragraph_context(book_ref, para_id).await {
            contexts.push(ParagraphContext { para_id, text });
        }
    }

    debug!(
        "Batch {} of book {}: {} paragraph context(s)",
        batch.batch_id,
        batch.book_id,
        contexts.len()
    );
    contexts
}
