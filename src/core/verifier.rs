//! Post-transfer integrity check of destination objects against the source.
//!
//! Hashes are compared when both sides report one. Otherwise the check falls
//! back to size, plus modification time if configured, and the result says so
//! in its `reason`. A mismatch never deletes or re-uploads anything; the record
//! keeps `Transferred` with the mismatch noted and is checked again next run.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::MigrationContext;
use crate::core::models::{
    RemotePath, TransferRecord, TransferState, VerificationMethod, VerificationResult,
};
use crate::core::progress::ProgressStore;
use crate::core::retry::{RetryBudget, RetryPolicy, call_with_retry};
use crate::core::storage::{ObjectMetadata, StorageClient, size_scaled_timeout};
use crate::error::{ErrorClass, MigrationError, Result, StorageError};

/// Providers round modification times differently; anything closer than this
/// counts as the same instant.
const MTIME_TOLERANCE_SECS: i64 = 2;

pub struct Verifier {
    source: Arc<dyn StorageClient>,
    destination: Arc<dyn StorageClient>,
    source_root: RemotePath,
    policy: RetryPolicy,
    budget: Arc<RetryBudget>,
    timeout: Duration,
    compare_modified_time: bool,
}

impl Verifier {
    pub fn new(
        ctx: &MigrationContext,
        source: Arc<dyn StorageClient>,
        destination: Arc<dyn StorageClient>,
    ) -> Self {
        Self {
            source,
            destination,
            source_root: ctx.config.source_root(),
            policy: ctx.policy,
            budget: Arc::clone(&ctx.budget),
            timeout: ctx.config.operation_timeout(),
            compare_modified_time: ctx.config.verify_modified_time,
        }
    }

    /// Verify the record at `path`, which must be `Transferred`, and store
    /// the verdict: `Verified` on a match, the mismatch reason otherwise.
    ///
    /// Only a fatal storage error is returned as `Err`; any other failure to
    /// read metadata is reported as an unmatched result.
    pub async fn verify(
        &self,
        store: &mut ProgressStore,
        path: &RemotePath,
    ) -> Result<VerificationResult> {
        let mut record = store
            .get(path)
            .cloned()
            .ok_or_else(|| MigrationError::UnknownRecord(path.clone()))?;

        if record.state != TransferState::Transferred {
            return Err(MigrationError::NotTransferred {
                path: path.clone(),
                state: record.state,
            });
        }

        let result = self.compare(&record).await?;

        if result.matched {
            record.state = TransferState::Verified;
            record.mismatch = None;
            if result.is_low_confidence() {
                debug!(path = %path, reason = ?result.reason, "Verified without hash");
            }
        } else {
            let reason = result
                .reason
                .clone()
                .unwrap_or_else(|| "verification failed".to_string());
            warn!(path = %path, reason = %reason, "Verification mismatch");
            record.mismatch = Some(reason);
        }
        store.upsert(record).await?;

        Ok(result)
    }

    async fn compare(&self, record: &TransferRecord) -> Result<VerificationResult> {
        let source_path = self.source_root.concat(&record.path);
        let destination_path = &record.destination_path;

        let mut result = VerificationResult {
            path: record.path.clone(),
            matched: false,
            method: self.fallback_method(),
            source_hash: None,
            destination_hash: None,
            source_size: None,
            destination_size: None,
            reason: None,
        };

        let source = match self
            .fetch(self.source.as_ref(), &source_path, record.size)
            .await?
        {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => {
                result.reason = Some("missing in source".to_string());
                return Ok(result);
            }
            Err(e) => {
                result.reason = Some(format!("source metadata unavailable: {}", e));
                return Ok(result);
            }
        };
        result.source_hash = source.hash.clone();
        result.source_size = Some(source.size);

        let destination = match self
            .fetch(self.destination.as_ref(), destination_path, record.size)
            .await?
        {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => {
                result.reason = Some("missing in destination".to_string());
                return Ok(result);
            }
            Err(e) => {
                result.reason = Some(format!("destination metadata unavailable: {}", e));
                return Ok(result);
            }
        };
        result.destination_hash = destination.hash.clone();
        result.destination_size = Some(destination.size);

        if let (Some(src), Some(dst)) = (&source.hash, &destination.hash) {
            result.method = VerificationMethod::Hash;
            result.matched = src == dst;
            if !result.matched {
                result.reason = Some(format!(
                    "hash mismatch: source {} != destination {}",
                    src, dst
                ));
            }
        } else {
            self.compare_without_hash(&source, &destination, &mut result);
        }

        Ok(result)
    }

    fn compare_without_hash(
        &self,
        source: &ObjectMetadata,
        destination: &ObjectMetadata,
        result: &mut VerificationResult,
    ) {
        if source.size != destination.size {
            result.reason = Some(format!(
                "hash unavailable; size mismatch: source {} bytes, destination {} bytes",
                source.size, destination.size
            ));
            return;
        }

        if self.compare_modified_time {
            let drift = (source.modified_time - destination.modified_time)
                .num_seconds()
                .abs();
            if drift > MTIME_TOLERANCE_SECS {
                result.reason = Some(format!(
                    "hash unavailable; modified time differs by {}s",
                    drift
                ));
                return;
            }
            result.reason = Some("hash unavailable, compared by size and modified time".into());
        } else {
            result.reason = Some("hash unavailable, compared by size".into());
        }
        result.matched = true;
    }

    fn fallback_method(&self) -> VerificationMethod {
        if self.compare_modified_time {
            VerificationMethod::SizeAndTime
        } else {
            VerificationMethod::Size
        }
    }

    /// Metadata with retries. The outer `Result` carries run-halting errors,
    /// the inner one everything that only affects this file. A backend may
    /// hash the whole object to answer, so the time limit grows with `size`.
    async fn fetch(
        &self,
        client: &dyn StorageClient,
        path: &RemotePath,
        size: u64,
    ) -> Result<std::result::Result<ObjectMetadata, StorageError>> {
        let outcome = call_with_retry(
            &self.policy,
            &self.budget,
            size_scaled_timeout(self.timeout, size),
            "metadata",
            path,
            move || client.metadata(path),
        )
        .await;

        match outcome {
            Err(e) if e.class() == ErrorClass::Fatal => Err(MigrationError::Storage {
                path: path.clone(),
                source: e,
            }),
            other => Ok(other),
        }
    }
}

/// Log a one-line tally for a batch of verification results.
pub fn log_batch_results(batch: usize, results: &[VerificationResult]) {
    let matched = results.iter().filter(|r| r.matched).count();
    let low_confidence = results
        .iter()
        .filter(|r| r.matched && r.is_low_confidence())
        .count();
    info!(
        batch,
        checked = results.len(),
        matched,
        mismatched = results.len() - matched,
        low_confidence,
        "Batch verification complete"
    );
}
