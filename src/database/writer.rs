/*!
 * Single-writer persistence actor.
 *
 * One dedicated thread owns the store connection for the whole run. Workers
 * send `WriteRequest`s through a bounded channel and wait for the outcome on a
 * oneshot channel. Requests are applied strictly in arrival order, one
 * transaction per request, so no two transactions are ever open at once.
 */

use log::{debug, error, info, warn};
use rusqlite::{params, Connection};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::models::TranslatedLine;
use super::schema;
use crate::errors::StoreError;

/// Default capacity of the request channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A batch of validated translations to persist atomically
#[derive(Debug)]
pub struct WriteRequest {
    pub book_id: String,
    pub translations: Vec<TranslatedLine>,
    respond_to: oneshot::Sender<Result<usize, StoreError>>,
}

#[derive(Debug)]
enum WriterMessage {
    Write(WriteRequest),
    Shutdown,
}

/// Writer settings
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub channel_capacity: usize,
    /// How long a submitter waits for room in the queue
    pub submit_timeout: Duration,
    /// How long a submitter waits for the writer's acknowledgment
    pub ack_timeout: Duration,
    /// Optional audit log of every applied translation
    pub audit_log_path: Option<PathBuf>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            submit_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(30),
            audit_log_path: None,
        }
    }
}

/// Counters reported when the writer stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub requests_applied: usize,
    pub requests_failed: usize,
    pub rows_updated: usize,
}

/// Owns the connection on the writer thread
struct SentenceWriter {
    conn: Connection,
    audit_log: Option<BufWriter<File>>,
    stats: WriterStats,
}

impl SentenceWriter {
    fn new(conn: Connection, audit_log_path: Option<&Path>) -> Result<Self, StoreError> {
        let audit_log = match audit_log_path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        Ok(Self {
            conn,
            audit_log,
            stats: WriterStats::default(),
        })
    }

    fn handle(&mut self, request: &WriteRequest) -> Result<usize, StoreError> {
        match self.apply(request) {
            Ok(updated) => {
                self.stats.requests_applied += 1;
                self.stats.rows_updated += updated;
                if updated < request.translations.len() {
                    warn!(
                        "Book {}: {} of {} translated line(s) matched no sentence",
                        request.book_id,
                        request.translations.len() - updated,
                        request.translations.len()
                    );
                }
                self.append_audit(request);
                debug!("Book {}: committed {} row(s)", request.book_id, updated);
                Ok(updated)
            }
            Err(e) => {
                self.stats.requests_failed += 1;
                error!("Book {}: write transaction rolled back: {}", request.book_id, e);
                Err(StoreError::RolledBack(e.to_string()))
            }
        }
    }

    // Dropping the transaction without commit rolls it back
    fn apply(&mut self, request: &WriteRequest) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE sentences SET translated_text = ?1 WHERE book_id = ?2 AND para_id = ?3 AND line_id = ?4",
            )?;
            for translation in &request.translations {
                updated += stmt.execute(params![
                    translation.translated_text,
                    request.book_id,
                    translation.line.para_id,
                    translation.line.line_id
                ])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    fn append_audit(&mut self, request: &WriteRequest) {
        let Some(log) = self.audit_log.as_mut() else {
            return;
        };

        let result = request
            .translations
            .iter()
            .try_for_each(|t| {
                writeln!(
                    log,
                    "{}\t{}\t{}\t{}\t{}",
                    request.book_id,
                    t.line.para_id,
                    t.line.line_id,
                    single_line(&t.source_text),
                    single_line(&t.translated_text)
                )
            })
            .and_then(|_| writeln!(log, "{}", "-".repeat(40)))
            .and_then(|_| log.flush());

        if let Err(e) = result {
            warn!("Failed to append to translation audit log: {}", e);
        }
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\n', '\r', '\t'], " ")
}

fn run_writer(mut writer: SentenceWriter, mut rx: mpsc::Receiver<WriterMessage>) -> WriterStats {
    while let Some(message) = rx.blocking_recv() {
        match message {
            WriterMessage::Write(request) => {
                let result = writer.handle(&request);
                // The submitter may have given up waiting
                let _ = request.respond_to.send(result);
            }
            WriterMessage::Shutdown => break,
        }
    }

    info!(
        "Persistence writer stopped: {} request(s) applied, {} failed, {} row(s) updated",
        writer.stats.requests_applied, writer.stats.requests_failed, writer.stats.rows_updated
    );
    writer.stats
}

/// Cloneable submission side of the writer
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterMessage>,
    submit_timeout: Duration,
    ack_timeout: Duration,
}

/// A queued request awaiting its acknowledgment
#[derive(Debug)]
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<usize, StoreError>>,
    ack_timeout: Duration,
}

impl PendingWrite {
    /// Wait for the writer to commit or roll back the request
    pub async fn wait(self) -> Result<usize, StoreError> {
        match tokio::time::timeout(self.ack_timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StoreError::WriterStopped),
            Err(_) => Err(StoreError::AckTimedOut(self.ack_timeout.as_secs())),
        }
    }
}

impl WriterHandle {
    /// Queue a request without waiting for it to be applied
    pub async fn enqueue(
        &self,
        book_id: &str,
        translations: Vec<TranslatedLine>,
    ) -> Result<PendingWrite, StoreError> {
        let (respond_to, rx) = oneshot::channel();
        let message = WriterMessage::Write(WriteRequest {
            book_id: book_id.to_string(),
            translations,
            respond_to,
        });

        match tokio::time::timeout(self.submit_timeout, self.tx.send(message)).await {
            Ok(Ok(())) => Ok(PendingWrite {
                rx,
                ack_timeout: self.ack_timeout,
            }),
            Ok(Err(_)) => Err(StoreError::WriterStopped),
            Err(_) => Err(StoreError::QueueFull),
        }
    }

    /// Queue a request and wait for its outcome; returns the rows updated
    pub async fn submit(&self, book_id: &str, translations: Vec<TranslatedLine>) -> Result<usize, StoreError> {
        if translations.is_empty() {
            return Ok(0);
        }
        self.enqueue(book_id, translations).await?.wait().await
    }
}

/// The persistence writer service with an explicit start/stop lifecycle
pub struct PersistenceWriter {
    handle: WriterHandle,
    thread: Option<JoinHandle<WriterStats>>,
}

impl PersistenceWriter {
    /// Open the store at `path` for writing and start the writer thread
    pub fn open<P: AsRef<Path>>(path: P, options: WriterOptions) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Starting persistence writer on {:?}", path);

        let conn = Connection::open(path)?;
        schema::configure_writer(&conn)?;
        schema::verify_schema(&conn)?;

        Self::start(conn, options)
    }

    /// Start the writer thread on an already configured connection
    pub fn start(conn: Connection, options: WriterOptions) -> Result<Self, StoreError> {
        let writer = SentenceWriter::new(conn, options.audit_log_path.as_deref())?;
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));

        let thread = std::thread::Builder::new()
            .name("persistence-writer".to_string())
            .spawn(move || run_writer(writer, rx))?;

        Ok(Self {
            handle: WriterHandle {
                tx,
                submit_timeout: options.submit_timeout,
                ack_timeout: options.ack_timeout,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Stop after the requests already queued and wait for the thread to exit
    pub async fn stop(mut self) -> Result<WriterStats, StoreError> {
        // A closed channel means the thread has already exited
        let _ = self.handle.tx.send(WriterMessage::Shutdown).await;

        let Some(thread) = self.thread.take() else {
            return Ok(WriterStats::default());
        };

        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| StoreError::RolledBack(format!("writer join task failed: {}", e)))?
            .map_err(|_| StoreError::WriterStopped)
    }
}

impl Drop for PersistenceWriter {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.handle.tx.try_send(WriterMessage::Shutdown);
        }
    }
}
