/*!
 * Integration tests for the per-book retry state machine, worker pool and deadline
 */

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use corpus_translator::RunError;
use corpus_translator::app_config::{DiagnosticsConfig, PipelineConfig};
use corpus_translator::database::{LineRef, TranslatedLine};
use corpus_translator::diagnostics::Diagnostics;
use corpus_translator::providers::{MockProvider, MockReply};
use corpus_translator::translation::ledger::WrittenLedger;
use corpus_translator::translation::{BatchDisposition, BookJob, ChunkScheduler};

use crate::common::{self, TestStore};

fn job(store: &TestStore, book_id: &str, count: usize, size: usize, max_chunk_chars: usize) -> BookJob {
    let sentences = common::sentences(book_id, count, size);
    store.insert(&sentences).unwrap();
    BookJob {
        book_id: book_id.to_string(),
        book_ref: book_id.to_string(),
        batches: ChunkScheduler::new(max_chunk_chars).schedule(&sentences),
    }
}

fn no_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn test_runBook_echo_shouldWriteEveryRow() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "mn1", 5, 100, 250);
    assert_eq!(job.batches.len(), 3);

    let provider = Arc::new(MockProvider::echo());
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider.clone(),
        common::pool(&["k1"]),
        common::fast_pipeline(),
        Diagnostics::disabled(),
    )
    .unwrap();

    let mut seen = Vec::new();
    let report = orchestrator
        .run_book(job, no_shutdown(), |r| seen.push(r.batch_id))
        .await
        .unwrap();
    let stats = writer.stop().await.unwrap();

    assert_eq!(report.succeeded, 3);
    assert_eq!(report.rows_written, 5);
    assert!(report.dropped.is_empty() && report.abandoned.is_empty());
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(stats.rows_updated, 5);
    assert_eq!(store.translated_count().unwrap(), 5);
    let first = store.translation("mn1", 1, 1).unwrap().unwrap();
    assert!(first.starts_with("[translated] mn1-1-"));
}

#[tokio::test]
async fn test_runBook_persistentMismatchWithOneRetry_shouldCallTwiceAndDrop() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "sn1", 5, 20, 250);
    assert_eq!(job.batches.len(), 1);

    let drop_report = store.file("drops.jsonl");
    let diagnostics = Diagnostics::from_config(&DiagnosticsConfig {
        drop_report_path: Some(drop_report.clone()),
        ..DiagnosticsConfig::default()
    })
    .unwrap();
    let provider = Arc::new(MockProvider::new(Vec::new(), MockReply::EchoMissing(1)));
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider.clone(),
        common::pool(&["k1"]),
        PipelineConfig {
            max_retries: 1,
            ..common::fast_pipeline()
        },
        diagnostics,
    )
    .unwrap();

    let report = orchestrator.run_book(job, no_shutdown(), |_| {}).await.unwrap();
    writer.stop().await.unwrap();

    assert_eq!(provider.call_count(), 2);
    assert_eq!(report.rows_written, 0);
    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].cause, "structural_mismatch");
    assert_eq!(store.translated_count().unwrap(), 0);

    let lines: Vec<serde_json::Value> = std::fs::read_to_string(&drop_report)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["book_id"], "sn1");
    assert_eq!(lines[0]["attempts"], 2);
    assert_eq!(lines[0]["expected_ids"].as_array().unwrap().len(), 5);
    assert_eq!(lines[0]["actual_ids"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_runBook_noRetries_shouldMakeExactlyOneAttempt() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "an1", 3, 20, 250);

    let provider = Arc::new(MockProvider::new(Vec::new(), MockReply::Text("not json at all".into())));
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider.clone(),
        common::pool(&["k1"]),
        common::fast_pipeline(),
        Diagnostics::disabled(),
    )
    .unwrap();

    let report = orchestrator.run_book(job, no_shutdown(), |_| {}).await.unwrap();
    writer.stop().await.unwrap();

    assert_eq!(provider.call_count(), 1);
    assert_eq!(report.dropped[0].cause, "malformed_response");
}

#[tokio::test]
async fn test_runBook_mismatchThenValid_shouldSucceedAfterRetry() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "an2", 4, 20, 250);

    let provider = Arc::new(MockProvider::scripted(vec![MockReply::EchoMissing(2)]));
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider.clone(),
        common::pool(&["k1"]),
        PipelineConfig {
            max_retries: 2,
            ..common::fast_pipeline()
        },
        Diagnostics::disabled(),
    )
    .unwrap();

    let mut dispositions = Vec::new();
    let report = orchestrator
        .run_book(job, no_shutdown(), |r| dispositions.push(r.disposition.clone()))
        .await
        .unwrap();
    writer.stop().await.unwrap();

    assert_eq!(provider.call_count(), 2);
    assert_eq!(report.retried, 1);
    assert!(matches!(
        dispositions.as_slice(),
        [BatchDisposition::Succeeded { attempts: 2, rows_written: 4 }]
    ));
    assert_eq!(store.translated_count().unwrap(), 4);
}

#[tokio::test]
async fn test_runBook_quotaOnOnlyCredential_shouldBeFatal() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "kn1", 4, 100, 250);

    let pool = common::pool(&["only"]);
    let provider = Arc::new(MockProvider::new(Vec::new(), MockReply::quota_exhausted()));
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider,
        pool.clone(),
        PipelineConfig {
            max_retries: 3,
            ..common::fast_pipeline()
        },
        Diagnostics::disabled(),
    )
    .unwrap();

    let result = orchestrator.run_book(job, no_shutdown(), |_| {}).await;
    writer.stop().await.unwrap();

    assert!(matches!(result, Err(RunError::CredentialsExhausted)));
    assert!(pool.is_empty());
    assert_eq!(store.translated_count().unwrap(), 0);
}

#[tokio::test]
async fn test_runBook_quotaThenRetry_shouldUseRemainingCredential() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "kn2", 2, 20, 250);

    let pool = common::pool(&["k1", "k2"]);
    let provider = Arc::new(MockProvider::scripted(vec![MockReply::quota_exhausted()]));
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider.clone(),
        pool.clone(),
        PipelineConfig {
            max_retries: 1,
            ..common::fast_pipeline()
        },
        Diagnostics::disabled(),
    )
    .unwrap();

    let report = orchestrator.run_book(job, no_shutdown(), |_| {}).await.unwrap();
    writer.stop().await.unwrap();

    let calls = provider.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].credential, calls[1].credential);
    assert!(pool.is_removed(&calls[0].credential));
    assert_eq!(pool.len(), 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(store.translated_count().unwrap(), 2);
}

#[tokio::test]
async fn test_runBook_manyBatches_shouldNotExceedWorkerCount() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "sn2", 20, 200, 250);
    assert_eq!(job.batches.len(), 20);

    let provider = Arc::new(MockProvider::new(
        Vec::new(),
        MockReply::delayed(Duration::from_millis(30), MockReply::Echo),
    ));
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider.clone(),
        common::pool(&["k1", "k2"]),
        PipelineConfig {
            worker_count: 3,
            ..common::fast_pipeline()
        },
        Diagnostics::disabled(),
    )
    .unwrap();

    let report = orchestrator.run_book(job, no_shutdown(), |_| {}).await.unwrap();
    writer.stop().await.unwrap();

    assert!(provider.peak_concurrency() <= 3, "peak was {}", provider.peak_concurrency());
    assert!(provider.peak_concurrency() >= 1);
    assert_eq!(report.succeeded, 20);
    assert_eq!(store.translated_count().unwrap(), 20);
}

#[tokio::test]
async fn test_runBook_hangingCalls_shouldAbandonAtDeadline() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "dn2", 6, 100, 250);
    assert_eq!(job.batches.len(), 3);

    // The first call answers, every other call hangs until the deadline
    let provider = Arc::new(MockProvider::new(vec![MockReply::Echo], MockReply::Hang));
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider.clone(),
        common::pool(&["k1"]),
        PipelineConfig {
            worker_count: 3,
            call_timeout_secs: 30,
            retry_call_timeout_secs: 30,
            book_deadline_secs: 1,
            ..common::fast_pipeline()
        },
        Diagnostics::disabled(),
    )
    .unwrap();

    let started = std::time::Instant::now();
    let report = orchestrator.run_book(job, no_shutdown(), |_| {}).await.unwrap();
    writer.stop().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.deadline_exceeded);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.abandoned.len(), 2);
    assert_eq!(report.rows_written, 2);
    assert_eq!(store.translated_count().unwrap(), 2);
}

#[tokio::test]
async fn test_runBook_callTimeout_shouldDropAsTimedOut() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "dn3", 2, 20, 250);

    let provider = Arc::new(MockProvider::new(Vec::new(), MockReply::Hang));
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider.clone(),
        common::pool(&["k1"]),
        PipelineConfig {
            call_timeout_secs: 1,
            retry_call_timeout_secs: 1,
            ..common::fast_pipeline()
        },
        Diagnostics::disabled(),
    )
    .unwrap();

    let report = orchestrator.run_book(job, no_shutdown(), |_| {}).await.unwrap();
    writer.stop().await.unwrap();

    assert!(!report.deadline_exceeded);
    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].cause, "timed_out");
    assert_eq!(provider.peak_concurrency(), 1);
}

#[tokio::test]
async fn test_runBook_interrupt_shouldStopAndReportInterrupted() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "dn4", 4, 100, 250);

    let provider = Arc::new(MockProvider::new(Vec::new(), MockReply::Hang));
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider,
        common::pool(&["k1"]),
        common::fast_pipeline(),
        Diagnostics::disabled(),
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = shutdown_tx.send(true);
    });

    let result = orchestrator.run_book(job, shutdown_rx, |_| {}).await;
    writer.stop().await.unwrap();

    assert!(matches!(result, Err(RunError::Interrupted)));
    assert_eq!(store.translated_count().unwrap(), 0);
}

#[tokio::test]
async fn test_runBook_rejectedWrite_shouldRetryAndCommitOnce() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "vn1", 1, 20, 250);
    store
        .connection()
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject BEFORE UPDATE ON sentences WHEN NEW.translated_text = 'boom'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();

    // A structurally valid answer the store refuses, then a good one
    let provider = Arc::new(MockProvider::new(
        vec![MockReply::Text(r#"{"lines":[{"para_id":1,"line_id":1,"text":"boom"}]}"#.into())],
        MockReply::Echo,
    ));
    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        provider.clone(),
        common::pool(&["k1"]),
        PipelineConfig {
            max_retries: 1,
            ..common::fast_pipeline()
        },
        Diagnostics::disabled(),
    )
    .unwrap();

    let report = orchestrator.run_book(job, no_shutdown(), |_| {}).await.unwrap();
    let stats = writer.stop().await.unwrap();

    assert_eq!(provider.call_count(), 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.requests_applied, 1);
    assert_eq!(store.translated_count().unwrap(), 1);
    let text = store.translation("vn1", 1, 1).unwrap().unwrap();
    assert!(text.starts_with("[translated] vn1-1-"));
}

#[tokio::test]
async fn test_runBook_unboundedLimits_shouldRunWithoutOverflow() {
    common::init_logging();
    let store = TestStore::new().unwrap();
    let job = job(&store, "vn2", 3, 100, 250);

    let (orchestrator, writer) = common::orchestrator(
        &store.path,
        Arc::new(MockProvider::echo()),
        common::pool(&["k1"]),
        PipelineConfig {
            worker_count: usize::MAX,
            book_deadline_secs: u64::MAX,
            ..common::fast_pipeline()
        },
        Diagnostics::disabled(),
    )
    .unwrap();

    let report = orchestrator.run_book(job, no_shutdown(), |_| {}).await.unwrap();
    writer.stop().await.unwrap();

    assert!(!report.deadline_exceeded);
    assert_eq!(report.rows_written, 3);
}

#[test]
fn test_writtenLedger_repeatedLines_shouldNotBeResubmitted() {
    let ledger = WrittenLedger::new();
    let lines: Vec<TranslatedLine> = (1..=3)
        .map(|line_id| TranslatedLine {
            line: LineRef::new(1, line_id),
            source_text: format!("source {}", line_id),
            translated_text: format!("target {}", line_id),
        })
        .collect();

    let first = ledger.unwritten("vn3", lines.clone());
    assert_eq!(first.len(), 3);
    ledger.mark_written("vn3", &first);

    assert!(ledger.unwritten("vn3", lines.clone()).is_empty());
    assert_eq!(ledger.unwritten("vn4", lines).len(), 3);
    assert_eq!(ledger.len(), 3);
}
