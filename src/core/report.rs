//! Per-run verification report, written as JSON next to the progress file.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::core::models::{RemotePath, RunSummary, TransferState, VerificationResult};
use crate::core::progress::{ProgressStore, write_atomic};
use crate::error::{MigrationError, Result};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Halted(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub path: RemotePath,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MismatchedFile {
    pub path: RemotePath,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub summary: RunSummary,
    pub bytes_transferred: u64,
    /// Verifications performed during this run, in order
    pub results: Vec<VerificationResult>,
    /// Every record, from this run or earlier, whose last verification failed
    pub mismatched: Vec<MismatchedFile>,
    pub failed: Vec<FailedFile>,
    /// Source folders this run could not list
    pub skipped_folders: Vec<RemotePath>,
}

impl VerificationReport {
    pub fn build(
        run_id: Uuid,
        outcome: RunOutcome,
        store: &ProgressStore,
        bytes_transferred: u64,
        results: Vec<VerificationResult>,
        skipped_folders: Vec<RemotePath>,
    ) -> Self {
        let mismatched = store
            .records()
            .filter_map(|r| {
                r.mismatch.as_ref().map(|reason| MismatchedFile {
                    path: r.path.clone(),
                    reason: reason.clone(),
                })
            })
            .collect();
        let failed = store
            .records()
            .filter(|r| r.state == TransferState::Failed)
            .map(|r| FailedFile {
                path: r.path.clone(),
                attempts: r.attempts,
                last_error: r.last_error.clone(),
            })
            .collect();

        Self {
            run_id,
            generated_at: Utc::now(),
            outcome,
            summary: store.snapshot(),
            bytes_transferred,
            results,
            mismatched,
            failed,
            skipped_folders,
        }
    }

    /// File name for this report: `migration_verification_<timestamp>_<id>.json`.
    pub fn file_name(&self) -> String {
        let id = self.run_id.simple().to_string();
        format!(
            "migration_verification_{}_{}.json",
            self.generated_at.format("%Y%m%d_%H%M%S"),
            &id[id.len() - 8..]
        )
    }

    /// Write the report into `dir`, creating it if needed.
    pub async fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.file_name());
        let report_err = |source| MigrationError::Report {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(dir).await.map_err(report_err)?;
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| report_err(std::io::Error::other(e)))?;
        write_atomic(&path, &bytes).await.map_err(report_err)?;

        info!(
            report = %path.display(),
            mismatched = self.mismatched.len(),
            failed = self.failed.len(),
            skipped_folders = self.skipped_folders.len(),
            "Verification report written"
        );
        Ok(path)
    }
}
