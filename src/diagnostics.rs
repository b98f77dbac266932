/*!
 * Run diagnostics: drop report and raw response capture.
 *
 * Both outputs are optional and best-effort. A failure to write them is
 * logged and never affects the run.
 */

use chrono::Local;
use log::{error, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::app_config::DiagnosticsConfig;
use crate::errors::StoreError;

/// One dropped batch, as written to the drop report
#[derive(Debug, Clone, Serialize)]
pub struct DropRecord {
    pub book_id: String,
    pub batch_id: usize,
    /// Kind of the last failed attempt
    pub cause: String,
    pub detail: String,
    pub attempts: u32,
    pub expected_ids: Vec<String>,
    pub actual_ids: Vec<String>,
    pub response_preview: Option<String>,
}

#[derive(Serialize)]
struct DropReportLine<'a> {
    run_id: String,
    timestamp: String,
    #[serde(flatten)]
    record: &'a DropRecord,
}

pub struct Diagnostics {
    run_id: Uuid,
    drop_report: Option<Mutex<File>>,
    response_debug_dir: Option<PathBuf>,
}

impl Diagnostics {
    /// Diagnostics that only log
    pub fn disabled() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            drop_report: None,
            response_debug_dir: None,
        }
    }

    pub fn from_config(config: &DiagnosticsConfig) -> Result<Self, StoreError> {
        let drop_report = match &config.drop_report_path {
            Some(path) => Some(Mutex::new(open_append(path)?)),
            None => None,
        };

        if let Some(dir) = &config.response_debug_dir {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            run_id: Uuid::new_v4(),
            drop_report,
            response_debug_dir: config.response_debug_dir.clone(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Log a dropped batch and append it to the drop report
    pub fn record_drop(&self, record: &DropRecord) {
        error!(
            "Dropped batch {} of book {} after {} attempt(s): {} ({})",
            record.batch_id, record.book_id, record.attempts, record.cause, record.detail
        );

        let Some(report) = &self.drop_report else {
            return;
        };

        let line = DropReportLine {
            run_id: self.run_id.to_string(),
            timestamp: Local::now().to_rfc3339(),
            record,
        };
        let result = serde_json::to_string(&line)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                let mut file = report.lock();
                writeln!(file, "{}", json).and_then(|_| file.flush())
            });

        if let Err(e) = result {
            warn!("Failed to append to drop report: {}", e);
        }
    }

    /// Append a raw response preview to `<dir>/<book_id>.log`
    pub fn record_response(&self, book_id: &str, batch_id: usize, attempt: u32, preview: &str) {
        let Some(dir) = &self.response_debug_dir else {
            return;
        };

        let path = dir.join(format!("{}.log", sanitize_file_name(book_id)));
        let result = open_append(&path).and_then(|mut file| {
            writeln!(
                file,
                "=== {} batch {} attempt {} ===\n{}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                batch_id,
                attempt + 1,
                preview
            )
        });

        if let Err(e) = result {
            warn!("Failed to write response debug log {:?}: {}", path, e);
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}
