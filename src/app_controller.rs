use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use regex::Regex;
use std::sync::Arc;
use tokio::sync::watch;

use crate::app_config::Config;
use crate::credentials::CredentialPool;
use crate::database::writer::DEFAULT_CHANNEL_CAPACITY;
use crate::database::{PersistenceWriter, SentenceStore, SentencesByBook, WriterOptions, WriterStats};
use crate::diagnostics::Diagnostics;
use crate::errors::RunError;
use crate::providers::{GeminiProvider, TextProvider};
use crate::translation::{
    Batch, BookJob, BookOrchestrator, BookReport, ChunkScheduler, ContextSource, NoContext, SqliteContextSource,
    TranslationClient,
};

// @module: Application controller for store-wide translation runs

/// External services a run talks to
pub struct RunServices {
    pub provider: Arc<dyn TextProvider>,
    pub pool: Arc<CredentialPool>,
    pub context: Arc<dyn ContextSource>,
}

/// Batch plan of one book
#[derive(Debug, Clone)]
pub struct BookPlan {
    pub book_id: String,
    pub book_ref: String,
    pub batches: Vec<Batch>,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub books: Vec<BookReport>,
    pub writer: WriterStats,
}

/// Summary of a run together with the error that cut it short, if any
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub error: Option<RunError>,
}

impl RunSummary {
    pub fn rows_written(&self) -> usize {
        self.books.iter().map(|b| b.rows_written).sum()
    }

    pub fn dropped_batches(&self) -> usize {
        self.books.iter().map(|b| b.dropped.len()).sum()
    }

    pub fn abandoned_batches(&self) -> usize {
        self.books.iter().map(|b| b.abandoned.len()).sum()
    }

    /// Log a per-book summary with drop causes
    pub fn log(&self) {
        for book in &self.books {
            info!("{}", book.summary());
            for dropped in &book.dropped {
                warn!("  batch {} dropped: {}", dropped.batch_id, dropped.cause);
            }
            if !book.abandoned.is_empty() {
                warn!("  abandoned batches: {:?}", book.abandoned);
            }
        }
        info!(
            "Run finished: {} book(s), {} row(s) written, {} batch(es) dropped, {} abandoned",
            self.books.len(),
            self.rows_written(),
            self.dropped_batches(),
            self.abandoned_batches()
        );
    }
}

/// Main application controller for translation runs
pub struct Controller {
    // @field: App configuration
    config: Config,
}

impl Controller {
    // @method: Create a new controller with the given configuration
    pub fn with_config(config: Config) -> Result<Self> {
        config.validate().context("Configuration validation failed")?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Batch plan of every book with pending sentences, without calling the service
    pub fn plan(&self, filter: Option<&Regex>) -> Result<Vec<BookPlan>> {
        let store = SentenceStore::open(&self.config.database_path)?;
        let scheduler = ChunkScheduler::new(self.config.pipeline.max_chunk_chars);

        store
            .untranslated_by_book(filter)?
            .into_iter()
            .map(|(book_id, sentences)| {
                Ok(BookPlan {
                    book_ref: store.book_ref(&book_id)?,
                    batches: scheduler.schedule(&sentences),
                    book_id,
                })
            })
            .collect()
    }

    /// Build the production services from the configuration and environment
    pub fn build_services(&self) -> Result<RunServices> {
        let system_prompt = self.config.provider.load_system_prompt()?;
        let provider = GeminiProvider::new(self.config.provider.clone(), system_prompt)
            .context("Failed to create Gemini client")?;

        let pool = CredentialPool::from_config(&self.config.credentials, |name| std::env::var(name).ok())?;

        let context: Arc<dyn ContextSource> = match &self.config.context.database_path {
            Some(path) => Arc::new(
                SqliteContextSource::open(path)
                    .with_context(|| format!("Failed to open context database: {:?}", path))?,
            ),
            None => Arc::new(NoContext),
        };

        Ok(RunServices {
            provider: Arc::new(provider),
            pool: Arc::new(pool),
            context,
        })
    }

    /// Run the main workflow with the production services
    pub async fn run(&self, filter: Option<&Regex>, shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        let services = self.build_services()?;
        Ok(self.run_with(services, filter, shutdown).await?)
    }

    /// Translate every pending book in sorted order using `services`
    ///
    /// The writer is stopped before returning, also when a run-fatal error
    /// cuts the run short. The partial summary is logged in that case.
    pub async fn run_with(
        &self,
        services: RunServices,
        filter: Option<&Regex>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary, RunError> {
        let RunOutcome { summary, error } = self.execute(services, filter, shutdown).await?;
        match error {
            None => Ok(summary),
            Some(e) => {
                summary.log();
                Err(e)
            }
        }
    }

    /// Like `run_with`, but keeps the summary of the books finished before
    /// a run-fatal error; only setup failures are returned as Err
    pub async fn execute(
        &self,
        services: RunServices,
        filter: Option<&Regex>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunOutcome, RunError> {
        let store = SentenceStore::open(&self.config.database_path)?;
        let books = store.untranslated_by_book(filter)?;
        if books.is_empty() {
            info!("No untranslated sentences found");
            return Ok(RunOutcome::default());
        }

        let pipeline = &self.config.pipeline;
        info!(
            "Found {} book(s) with {} untranslated sentence(s)",
            books.len(),
            books.values().map(Vec::len).sum::<usize>()
        );

        let diagnostics = Arc::new(Diagnostics::from_config(&self.config.diagnostics)?);
        let writer = PersistenceWriter::open(
            &self.config.database_path,
            WriterOptions {
                channel_capacity: DEFAULT_CHANNEL_CAPACITY,
                submit_timeout: pipeline.write_submit_timeout(),
                ack_timeout: pipeline.write_ack_timeout(),
                audit_log_path: self.config.diagnostics.translation_log_path.clone(),
            },
        )?;

        let orchestrator = BookOrchestrator::new(
            TranslationClient::new(services.provider, services.pool),
            writer.handle(),
            services.context,
            pipeline.clone(),
            diagnostics,
        );

        let mut summary = RunSummary::default();
        let outcome = self
            .translate_books(&store, &orchestrator, books, shutdown, &mut summary)
            .await;

        match writer.stop().await {
            Ok(stats) => summary.writer = stats,
            Err(e) => error!("Persistence writer did not stop cleanly: {}", e),
        }

        Ok(RunOutcome {
            summary,
            error: outcome.err(),
        })
    }

    async fn translate_books(
        &self,
        store: &SentenceStore,
        orchestrator: &BookOrchestrator,
        books: SentencesByBook,
        shutdown: watch::Receiver<bool>,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        let scheduler = ChunkScheduler::new(self.config.pipeline.max_chunk_chars);

        for (book_id, sentences) in books {
            let job = BookJob {
                book_ref: store.book_ref(&book_id)?,
                batches: scheduler.schedule(&sentences),
                book_id,
            };

            let progress_bar = Self::book_progress_bar(&job);
            let result = orchestrator
                .run_book(job, shutdown.clone(), |_| progress_bar.inc(1))
                .await;
            progress_bar.finish_and_clear();

            summary.books.push(result?);
        }

        Ok(())
    }

    fn book_progress_bar(job: &BookJob) -> ProgressBar {
        let progress_bar = ProgressBar::new(job.batches.len() as u64);
        let template_result = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({percent}%) {msg} {eta}")
            .or_else(|_| ProgressStyle::default_bar().template("{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} ({percent}%) {msg}"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        progress_bar.set_style(template_result.progress_chars("█▓▒░"));
        progress_bar.set_message(job.book_id.clone());
        progress_bar
    }
}
