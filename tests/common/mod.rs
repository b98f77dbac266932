/*!
 * Common test utilities for the corpus-translator test suite
 */

#![allow(dead_code)]

use anyhow::Result;
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use corpus_translator::app_config::{Config, PipelineConfig};
use corpus_translator::database::schema;
use corpus_translator::database::{PersistenceWriter, Sentence, WriterOptions};
use corpus_translator::diagnostics::Diagnostics;
use corpus_translator::providers::MockProvider;
use corpus_translator::translation::{BookOrchestrator, NoContext, TranslationClient};
use corpus_translator::{Credential, CredentialPool, RunServices};

/// Route library logs through the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A sentence store in a temporary directory
pub struct TestStore {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TestStore {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let path = dir.path().join("sentences.db");
        let conn = Connection::open(&path)?;
        schema::create_tables(&conn)?;
        Ok(Self { dir, path })
    }

    pub fn connection(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    /// Insert untranslated sentences
    pub fn insert(&self, sentences: &[Sentence]) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        for s in sentences {
            tx.execute(
                "INSERT INTO sentences (book_id, para_id, line_id, source_text) VALUES (?1, ?2, ?3, ?4)",
                params![s.book_id, s.line.para_id, s.line.line_id, s.source_text],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_book_ref(&self, book_id: &str, ref_id: &str) -> Result<()> {
        self.connection()?
            .execute("INSERT INTO books (book_id, ref_id) VALUES (?1, ?2)", params![book_id, ref_id])?;
        Ok(())
    }

    /// Translation of one sentence, `None` when still untranslated
    pub fn translation(&self, book_id: &str, para_id: i64, line_id: i64) -> Result<Option<String>> {
        Ok(self.connection()?.query_row(
            "SELECT translated_text FROM sentences WHERE book_id = ?1 AND para_id = ?2 AND line_id = ?3",
            params![book_id, para_id, line_id],
            |row| row.get(0),
        )?)
    }

    pub fn translated_count(&self) -> Result<usize> {
        let count: i64 = self.connection()?.query_row(
            "SELECT COUNT(*) FROM sentences WHERE translated_text IS NOT NULL AND translated_text != ''",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// A configuration pointing at this store with test-friendly timings
    pub fn config(&self, pipeline: PipelineConfig) -> Config {
        Config {
            database_path: self.path.clone(),
            pipeline,
            ..Config::default()
        }
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// `count` sentences of `size` characters each in one paragraph
pub fn sentences(book_id: &str, count: usize, size: usize) -> Vec<Sentence> {
    (1..=count)
        .map(|i| {
            let text: String = format!("{}-{}-", book_id, i).chars().chain(std::iter::repeat('a')).take(size).collect();
            Sentence::new(book_id, 1, i as i64, text)
        })
        .collect()
}

/// Pipeline settings that keep tests fast
pub fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        worker_count: 2,
        max_chunk_chars: 250,
        call_timeout_secs: 5,
        retry_call_timeout_secs: 5,
        max_retries: 0,
        book_deadline_secs: 30,
        retry_delay_ms: 0,
        timeout_retry_delay_ms: 0,
        ..PipelineConfig::default()
    }
}

pub fn pool(keys: &[&str]) -> Arc<CredentialPool> {
    Arc::new(CredentialPool::new(keys.iter().map(|k| Credential::new(*k)).collect()))
}

pub fn services(provider: Arc<MockProvider>, pool: Arc<CredentialPool>) -> RunServices {
    RunServices {
        provider,
        pool,
        context: Arc::new(NoContext),
    }
}

/// An orchestrator over `store` backed by `provider`, with its writer
pub fn orchestrator(
    store_path: &Path,
    provider: Arc<MockProvider>,
    pool: Arc<CredentialPool>,
    pipeline: PipelineConfig,
    diagnostics: Diagnostics,
) -> Result<(BookOrchestrator, PersistenceWriter)> {
    let writer = PersistenceWriter::open(store_path, WriterOptions::default())?;
    let orchestrator = BookOrchestrator::new(
        TranslationClient::new(provider, pool),
        writer.handle(),
        Arc::new(NoContext),
        pipeline,
        Arc::new(diagnostics),
    );
    Ok((orchestrator, writer))
}
