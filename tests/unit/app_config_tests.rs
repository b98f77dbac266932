/*!
 * Tests for loading and overriding the configuration file
 */

use std::fs;
use tempfile::TempDir;

use corpus_translator::Controller;
use corpus_translator::app_config::{Config, LogLevel, MAX_DURATION_SECS, MAX_WORKER_COUNT, PipelineOverrides};

#[test]
fn test_loadOrCreate_existingFile_shouldReadValues() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("conf.json");
    fs::write(
        &path,
        r#"{
            "database_path": "texts.db",
            "pipeline": { "worker_count": 3, "max_chunk_chars": 800, "max_retries": 2 },
            "diagnostics": { "drop_report_path": "drops.jsonl" },
            "log_level": "debug"
        }"#,
    )
    .unwrap();

    let config = Config::load_or_create(&path).unwrap();

    assert_eq!(config.database_path.to_str(), Some("texts.db"));
    assert_eq!(config.pipeline.worker_count, 3);
    assert_eq!(config.pipeline.max_chunk_chars, 800);
    assert_eq!(config.pipeline.max_attempts(), 3);
    assert_eq!(config.log_level, LogLevel::Debug);
    assert!(config.diagnostics.drop_report_path.is_some());
    assert!(config.diagnostics.response_debug_dir.is_none());
}

#[test]
fn test_loadOrCreate_invalidJson_shouldFail() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("conf.json");
    fs::write(&path, "{ not json").unwrap();

    assert!(Config::load_or_create(&path).is_err());
}

#[test]
fn test_overrides_thenController_shouldRejectInvalidValues() {
    let mut config = Config::default();
    config.apply_overrides(&PipelineOverrides {
        worker_count: Some(0),
        ..PipelineOverrides::default()
    });

    assert!(Controller::with_config(config).is_err());
}

#[test]
fn test_overrides_timeouts_shouldDriveAttemptTimeouts() {
    let mut config = Config::default();
    config.apply_overrides(&PipelineOverrides {
        call_timeout_secs: Some(90),
        retry_call_timeout_secs: Some(45),
        ..PipelineOverrides::default()
    });

    assert_eq!(config.pipeline.call_timeout(0).as_secs(), 90);
    assert_eq!(config.pipeline.call_timeout(1).as_secs(), 45);
    assert_eq!(config.pipeline.call_timeout(4).as_secs(), 45);
}

#[test]
fn test_validate_hugeBookDeadline_shouldFail() {
    let mut config = Config::default();
    config.apply_overrides(&PipelineOverrides {
        book_deadline_secs: Some(u64::MAX),
        ..PipelineOverrides::default()
    });
    assert!(config.validate().is_err());

    config.pipeline.book_deadline_secs = MAX_DURATION_SECS;
    assert!(config.validate().is_ok());
}

#[test]
fn test_validate_hugeWorkerCount_shouldFail() {
    let mut config = Config::default();
    config.apply_overrides(&PipelineOverrides {
        worker_count: Some(usize::MAX),
        ..PipelineOverrides::default()
    });
    assert!(config.validate().is_err());
    assert!(Controller::with_config(config.clone()).is_err());

    config.pipeline.worker_count = MAX_WORKER_COUNT;
    assert!(config.validate().is_ok());
}

#[test]
fn test_validate_hugeCallTimeout_shouldFail() {
    let mut config = Config::default();
    config.pipeline.call_timeout_secs = u64::MAX;

    assert!(config.validate().is_err());
}
