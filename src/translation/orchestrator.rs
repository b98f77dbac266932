/*!
 * Per-book orchestration.
 *
 * Every batch of a book runs as its own task, at most `worker_count` at a
 * time. A task drives its batch through up to `max_retries + 1` attempts and
 * ends as succeeded, dropped or abandoned. The book as a whole is bounded by
 * a deadline; when it passes, outstanding tasks are cancelled and their
 * results discarded.
 */

use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use super::client::{CallFailure, TranslationClient};
use super::codec::{self, StructuralMismatch};
use super::context::{collect_context, ContextSource};
use super::ledger::WrittenLedger;
use super::scheduler::Batch;
use crate::app_config::PipelineConfig;
use crate::credentials::Credential;
use crate::database::WriterHandle;
use crate::diagnostics::{DropRecord, Diagnostics};
use crate::errors::{RunError, StoreError};

/// Stands in for a deadline too distant to represent
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Result of one attempt at a batch
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Succeeded { rows_written: usize },
    StructuralMismatch(StructuralMismatch),
    MalformedResponse(String),
    TimedOut(Duration),
    QuotaExhausted(Credential),
    NetworkError(String),
    WriteFailed(String),
    /// The book was stopped while the attempt was running
    Cancelled,
}

impl AttemptOutcome {
    /// Stable name used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::StructuralMismatch(_) => "structural_mismatch",
            Self::MalformedResponse(_) => "malformed_response",
            Self::TimedOut(_) => "timed_out",
            Self::QuotaExhausted(_) => "quota_exhausted",
            Self::NetworkError(_) => "network_error",
            Self::WriteFailed(_) => "write_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Pause before the next attempt
    pub fn retry_delay(&self, config: &PipelineConfig) -> Duration {
        match self {
            Self::TimedOut(_) => config.timeout_retry_delay(),
            _ => config.retry_delay(),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded { rows_written } => write!(f, "succeeded ({} row(s) written)", rows_written),
            Self::StructuralMismatch(m) => write!(f, "structural mismatch: {}", m),
            Self::MalformedResponse(e) => write!(f, "malformed response: {}", e),
            Self::TimedOut(d) => write!(f, "timed out after {}s", d.as_secs_f32()),
            Self::QuotaExhausted(c) => write!(f, "quota exhausted for credential {}", c.redacted()),
            Self::NetworkError(e) => write!(f, "network error: {}", e),
            Self::WriteFailed(e) => write!(f, "write failed: {}", e),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal state of a batch
#[derive(Debug, Clone)]
pub enum BatchDisposition {
    Succeeded { attempts: u32, rows_written: usize },
    Dropped { attempts: u32, cause: AttemptOutcome },
    Abandoned,
}

impl BatchDisposition {
    /// Whether the batch reached a final verdict rather than being cut short
    pub fn is_settled(&self) -> bool {
        !matches!(self, BatchDisposition::Abandoned)
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: usize,
    pub disposition: BatchDisposition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedBatch {
    pub batch_id: usize,
    pub cause: String,
}

/// Everything that happened to one book
#[derive(Debug, Clone, Default)]
pub struct BookReport {
    pub book_id: String,
    pub total_batches: usize,
    pub succeeded: usize,
    /// Batches that needed more than one attempt to succeed
    pub retried: usize,
    pub dropped: Vec<DroppedBatch>,
    pub abandoned: Vec<usize>,
    pub rows_written: usize,
    pub deadline_exceeded: bool,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl BookReport {
    fn new(book_id: &str, total_batches: usize) -> Self {
        Self {
            book_id: book_id.to_string(),
            total_batches,
            ..Self::default()
        }
    }

    fn record(&mut self, report: &BatchReport) {
        match &report.disposition {
            BatchDisposition::Succeeded { attempts, rows_written } => {
                self.succeeded += 1;
                self.rows_written += rows_written;
                if *attempts > 1 {
                    self.retried += 1;
                }
            }
            BatchDisposition::Dropped { cause, .. } => self.dropped.push(DroppedBatch {
                batch_id: report.batch_id,
                cause: cause.kind().to_string(),
            }),
            BatchDisposition::Abandoned => self.abandoned.push(report.batch_id),
        }
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Book {}: {}/{} batch(es) succeeded ({} after retry), {} dropped, {} abandoned, {} row(s) written in {:.1}s",
            self.book_id,
            self.succeeded,
            self.total_batches,
            self.retried,
            self.dropped.len(),
            self.abandoned.len(),
            self.rows_written,
            self.elapsed.as_secs_f32()
        );
        if self.deadline_exceeded {
            summary.push_str(" [deadline exceeded]");
        }
        if self.interrupted {
            summary.push_str(" [interrupted]");
        }
        summary
    }
}

/// The batches of one book
#[derive(Debug, Clone)]
pub struct BookJob {
    pub book_id: String,
    /// Reference id used for context lookups
    pub book_ref: String,
    pub batches: Vec<Batch>,
}

/// Resolves once `signal` turns true; never resolves if its sender is gone
pub async fn cancelled(signal: &mut watch::Receiver<bool>) {
    let closed = signal.wait_for(|stop| *stop).await.is_err();
    if closed {
        futures::future::pending::<()>().await;
    }
}

struct Shared {
    client: TranslationClient,
    writer: WriterHandle,
    context: Arc<dyn ContextSource>,
    config: PipelineConfig,
    ledger: WrittenLedger,
    diagnostics: Arc<Diagnostics>,
}

/// Outcome of an attempt plus the response it was derived from
struct AttemptRecord {
    outcome: AttemptOutcome,
    response_preview: Option<String>,
}

impl AttemptRecord {
    fn bare(outcome: AttemptOutcome) -> Self {
        Self {
            outcome,
            response_preview: None,
        }
    }
}

/// Drives one batch through its attempts
struct BatchWorker {
    shared: Arc<Shared>,
    book_id: Arc<str>,
    book_ref: Arc<str>,
    cancel: watch::Receiver<bool>,
}

impl BatchWorker {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Sleep for `delay`; returns true when the book was stopped meanwhile
    async fn pause(&self, delay: Duration) -> bool {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = cancelled(&mut cancel) => true,
        }
    }

    fn report(&self, batch: &Batch, disposition: BatchDisposition) -> BatchReport {
        BatchReport {
            batch_id: batch.batch_id,
            disposition,
        }
    }

    async fn process(self, batch: Batch) -> Result<BatchReport, RunError> {
        let config = &self.shared.config;
        let max_attempts = config.max_attempts();
        let mut last: Option<AttemptRecord> = None;

        for attempt in 0..max_attempts {
            if let Some(previous) = &last {
                let delay = previous.outcome.retry_delay(config);
                info!(
                    "Retrying batch {} of book {} in {:.1}s (attempt {}/{})",
                    batch.batch_id,
                    self.book_id,
                    delay.as_secs_f32(),
                    attempt + 1,
                    max_attempts
                );
                if self.pause(delay).await {
                    return Ok(self.report(&batch, BatchDisposition::Abandoned));
                }
            }
            if self.is_cancelled() {
                return Ok(self.report(&batch, BatchDisposition::Abandoned));
            }

            let record = self.attempt(&batch, attempt).await?;
            match &record.outcome {
                AttemptOutcome::Succeeded { rows_written } => {
                    return Ok(self.report(
                        &batch,
                        BatchDisposition::Succeeded {
                            attempts: attempt + 1,
                            rows_written: *rows_written,
                        },
                    ));
                }
                AttemptOutcome::Cancelled => {
                    return Ok(self.report(&batch, BatchDisposition::Abandoned));
                }
                AttemptOutcome::QuotaExhausted(credential) => {
                    if self.shared.client.pool().remove(credential) == 0 {
                        error!("Credential pool exhausted while translating book {}", self.book_id);
                        return Err(RunError::CredentialsExhausted);
                    }
                }
                other => warn!(
                    "Batch {} of book {} attempt {}/{} failed: {}",
                    batch.batch_id,
                    self.book_id,
                    attempt + 1,
                    max_attempts,
                    other
                ),
            }
            last = Some(record);
        }

        let Some(record) = last else {
            return Ok(self.report(&batch, BatchDisposition::Abandoned));
        };
        self.record_drop(&batch, max_attempts, &record);

        Ok(self.report(
            &batch,
            BatchDisposition::Dropped {
                attempts: max_attempts,
                cause: record.outcome,
            },
        ))
    }

    fn record_drop(&self, batch: &Batch, attempts: u32, record: &AttemptRecord) {
        let actual_ids = match &record.outcome {
            AttemptOutcome::StructuralMismatch(m) => m.actual.iter().map(ToString::to_string).collect(),
            _ => Vec::new(),
        };

        self.shared.diagnostics.record_drop(&DropRecord {
            book_id: self.book_id.to_string(),
            batch_id: batch.batch_id,
            cause: record.outcome.kind().to_string(),
            detail: record.outcome.to_string(),
            attempts,
            expected_ids: batch.line_refs().iter().map(ToString::to_string).collect(),
            actual_ids,
            response_preview: record.response_preview.clone(),
        });
    }

    async fn attempt(&self, batch: &Batch, attempt: u32) -> Result<AttemptRecord, RunError> {
        let shared = &self.shared;
        let contexts = collect_context(shared.context.as_ref(), &self.book_ref, batch).await;
        let prompt = codec::encode(batch, &contexts);
        let timeout = shared.config.call_timeout(attempt);

        debug!(
            "Sending batch {} of book {} ({} line(s), {} char(s), timeout {}s)",
            batch.batch_id,
            self.book_id,
            batch.len(),
            batch.total_size,
            timeout.as_secs()
        );

        let mut cancel = self.cancel.clone();
        let call = tokio::select! {
            result = shared.client.call(&prompt, timeout) => result,
            _ = cancelled(&mut cancel) => return Ok(AttemptRecord::bare(AttemptOutcome::Cancelled)),
        };

        let response = match call {
            Ok(response) => response,
            Err(CallFailure::PoolExhausted) => return Err(RunError::CredentialsExhausted),
            Err(CallFailure::TimedOut(limit)) => return Ok(AttemptRecord::bare(AttemptOutcome::TimedOut(limit))),
            Err(CallFailure::QuotaExhausted(credential)) => {
                return Ok(AttemptRecord::bare(AttemptOutcome::QuotaExhausted(credential)));
            }
            Err(CallFailure::Network(message)) => {
                return Ok(AttemptRecord::bare(AttemptOutcome::NetworkError(message)));
            }
        };

        let preview = codec::preview(&response.text);
        if attempt == 0 {
            shared.diagnostics.record_response(&self.book_id, batch.batch_id, attempt, &preview);
        }

        let failed = |outcome: AttemptOutcome| -> Result<AttemptRecord, RunError> {
            Ok(AttemptRecord {
                outcome,
                response_preview: Some(preview.clone()),
            })
        };

        let elements = match codec::decode(&response.text) {
            Ok(elements) => elements,
            Err(e) => return failed(AttemptOutcome::MalformedResponse(e.to_string())),
        };
        let translations = match codec::validate(batch, elements) {
            Ok(translations) => translations,
            Err(mismatch) => return failed(AttemptOutcome::StructuralMismatch(mismatch)),
        };

        // Results that arrive after the book was stopped are discarded
        if self.is_cancelled() {
            return Ok(AttemptRecord::bare(AttemptOutcome::Cancelled));
        }

        // Guards against a late duplicate attempt rewriting rows this run already committed
        let pending = shared.ledger.unwritten(&self.book_id, translations);
        if pending.is_empty() {
            debug!("Batch {} of book {} was already written", batch.batch_id, self.book_id);
            return Ok(AttemptRecord::bare(AttemptOutcome::Succeeded { rows_written: 0 }));
        }

        match shared.writer.submit(&self.book_id, pending.clone()).await {
            Ok(rows_written) => {
                shared.ledger.mark_written(&self.book_id, &pending);
                info!(
                    "Batch {} of book {} written ({} row(s), {:.1}s call)",
                    batch.batch_id,
                    self.book_id,
                    rows_written,
                    response.elapsed.as_secs_f32()
                );
                Ok(AttemptRecord::bare(AttemptOutcome::Succeeded { rows_written }))
            }
            Err(StoreError::WriterStopped) => Err(RunError::Store(StoreError::WriterStopped)),
            Err(e) => failed(AttemptOutcome::WriteFailed(e.to_string())),
        }
    }
}

/// Runs the batches of one book at a time against the shared services
#[derive(Clone)]
pub struct BookOrchestrator {
    shared: Arc<Shared>,
}

impl BookOrchestrator {
    pub fn new(
        client: TranslationClient,
        writer: WriterHandle,
        context: Arc<dyn ContextSource>,
        config: PipelineConfig,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                writer,
                context,
                config,
                ledger: WrittenLedger::new(),
                diagnostics,
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Process every batch of `job`
    ///
    /// `shutdown` stops the book early when it turns true. `on_batch` is
    /// called for every batch that reaches a terminal state. A run-fatal
    /// error stops the book's remaining work and is returned after cleanup.
    pub async fn run_book(
        &self,
        job: BookJob,
        mut shutdown: watch::Receiver<bool>,
        mut on_batch: impl FnMut(&BatchReport),
    ) -> Result<BookReport, RunError> {
        let started = Instant::now();
        let config = &self.shared.config;
        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(config.book_deadline())
            .unwrap_or_else(|| now + FAR_FUTURE);
        let mut report = BookReport::new(&job.book_id, job.batches.len());

        info!(
            "Translating book {} ({} batch(es), {} worker(s))",
            job.book_id,
            job.batches.len(),
            config.worker_count
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.worker_count.clamp(1, Semaphore::MAX_PERMITS)));
        let book_id: Arc<str> = Arc::from(job.book_id.as_str());
        let book_ref: Arc<str> = Arc::from(job.book_ref.as_str());
        let mut outstanding: BTreeSet<usize> = job.batches.iter().map(|b| b.batch_id).collect();

        let mut tasks = JoinSet::new();
        for batch in job.batches {
            let worker = BatchWorker {
                shared: Arc::clone(&self.shared),
                book_id: Arc::clone(&book_id),
                book_ref: Arc::clone(&book_ref),
                cancel: cancel_rx.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| RunError::Interrupted)?;
                worker.process(batch).await
            });
        }

        let mut fatal: Option<RunError> = None;
        let mut stopped = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(batch_report))) => {
                        outstanding.remove(&batch_report.batch_id);
                        report.record(&batch_report);
                        on_batch(&batch_report);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Stopping book {}: {}", job.book_id, e);
                        fatal = Some(e);
                        stopped = true;
                        break;
                    }
                    Some(Err(e)) => error!("Batch task of book {} failed: {}", job.book_id, e),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "Book {} exceeded its {}s deadline; abandoning {} outstanding batch(es)",
                        job.book_id,
                        config.book_deadline_secs,
                        outstanding.len()
                    );
                    report.deadline_exceeded = true;
                    stopped = true;
                    break;
                }
                _ = cancelled(&mut shutdown) => {
                    warn!("Interrupt received; stopping book {}", job.book_id);
                    report.interrupted = true;
                    stopped = true;
                    break;
                }
            }
        }

        if stopped {
            let _ = cancel_tx.send(true);
            tasks.abort_all();
            // Verdicts reached before the abort still count, drops included
            while let Some(joined) = tasks.join_next().await {
                if let Ok(Ok(batch_report)) = joined {
                    if batch_report.disposition.is_settled() {
                        outstanding.remove(&batch_report.batch_id);
                        report.record(&batch_report);
                        on_batch(&batch_report);
                    }
                }
            }
        }

        report.abandoned.extend(outstanding);
        report.abandoned.sort_unstable();
        report.elapsed = started.elapsed();
        info!("{}", report.summary());

        match fatal {
            Some(e) => Err(e),
            None if report.interrupted => Err(RunError::Interrupted),
            None => Ok(report),
        }
    }
}
