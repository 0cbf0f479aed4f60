//! Moves one file from the source account to the destination account.
//!
//! A transfer attempt is the full download-then-upload cycle through a staged
//! local copy. The attempt counter is bumped and the record marked
//! `InProgress` durably before any bytes move, so a crash at any point is
//! visible on the next run and the file is simply attempted again.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::context::MigrationContext;
use crate::core::models::{FileDescriptor, RemotePath, TransferState};
use crate::core::progress::ProgressStore;
use crate::core::retry::{RetryBudget, RetryDecision, RetryPolicy};
use crate::core::staging::StagingArea;
use crate::core::storage::{Activity, StorageClient, Tracked, with_idle_timeout};
use crate::error::{ErrorClass, MigrationError, Result, StorageError};

/// How a single file's transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success { bytes: u64 },
    /// Retries exhausted or a permanent error; the record is now `Failed`
    Failed(String),
}

pub struct TransferEngine {
    source: Arc<dyn StorageClient>,
    destination: Arc<dyn StorageClient>,
    source_root: RemotePath,
    staging: StagingArea,
    policy: RetryPolicy,
    budget: Arc<RetryBudget>,
    timeout: Duration,
}

impl TransferEngine {
    pub fn new(
        ctx: &MigrationContext,
        source: Arc<dyn StorageClient>,
        destination: Arc<dyn StorageClient>,
        staging: StagingArea,
    ) -> Self {
        Self {
            source,
            destination,
            source_root: ctx.config.source_root(),
            staging,
            policy: ctx.policy,
            budget: Arc::clone(&ctx.budget),
            timeout: ctx.config.operation_timeout(),
        }
    }

    /// Transfer the file described by `descriptor` to `destination_root`.
    ///
    /// The record must currently be `Pending`. Transient failures are retried
    /// per the policy while the run's budget allows; the file then ends
    /// `Transferred` or `Failed`. A fatal storage error puts the record back to
    /// `Pending` and is returned as an error so the run can halt.
    pub async fn transfer(
        &self,
        store: &mut ProgressStore,
        descriptor: &FileDescriptor,
        destination_root: &RemotePath,
    ) -> Result<TransferOutcome> {
        let path = &descriptor.relative_path;
        let mut record = store
            .get(path)
            .cloned()
            .ok_or_else(|| MigrationError::UnknownRecord(path.clone()))?;

        if record.state != TransferState::Pending {
            return Err(MigrationError::InvalidTransition {
                path: path.clone(),
                from: record.state,
                to: TransferState::InProgress,
            });
        }

        let source_path = self.source_root.concat(path);
        let destination_path = destination_root.concat(path);
        record.destination_path = destination_path.clone();

        let start_time = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            record.attempts += 1;
            record.state = TransferState::InProgress;
            store.upsert(record.clone()).await?;

            debug!(path = %path, attempt, total_attempts = record.attempts, "Transfer attempt started");

            let error = match self
                .attempt(&source_path, &destination_path, descriptor)
                .await
            {
                Ok(bytes) => {
                    record.state = TransferState::Transferred;
                    record.size = bytes;
                    record.last_error = None;
                    record.mismatch = None;
                    store.upsert(record).await?;

                    info!(
                        path = %path,
                        bytes,
                        attempts = attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "File transferred"
                    );
                    return Ok(TransferOutcome::Success { bytes });
                }
                Err(e) => e,
            };

            record.last_error = Some(error.to_string());

            if error.class() == ErrorClass::Fatal {
                record.state = TransferState::Pending;
                store.upsert(record).await?;
                return Err(MigrationError::Storage {
                    path: path.clone(),
                    source: error,
                });
            }

            let reason = match self.policy.decide(attempt, &error) {
                RetryDecision::Retry(delay) if self.budget.try_consume() => {
                    warn!(
                        path = %path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transfer attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                RetryDecision::Retry(_) => format!("{} (retry budget exhausted)", error),
                RetryDecision::GiveUp => error.to_string(),
            };

            record.state = TransferState::Failed;
            record.last_error = Some(reason.clone());
            store.upsert(record).await?;

            warn!(path = %path, attempts = attempt, error = %reason, "File transfer failed");
            return Ok(TransferOutcome::Failed(reason));
        }
    }

    /// One download-then-upload cycle. The staged copy is removed on return,
    /// whether the cycle succeeded or not. Each leg may run as long as bytes
    /// keep moving; it times out once no byte has moved for the configured
    /// operation timeout.
    async fn attempt(
        &self,
        source_path: &RemotePath,
        destination_path: &RemotePath,
        descriptor: &FileDescriptor,
    ) -> Result<u64, StorageError> {
        let staged = self.staging.stage().map_err(|e| {
            StorageError::Fatal(format!(
                "cannot create staging file in {}: {}",
                self.staging.dir().display(),
                e
            ))
        })?;

        let writer = staged
            .writer()
            .map_err(|e| StorageError::Fatal(format!("cannot open staging file: {}", e)))?;
        let activity = Activity::new();
        let mut writer = Tracked::new(writer, activity.clone());
        let downloaded = with_idle_timeout(
            self.timeout,
            &activity,
            self.source.download(source_path, &mut writer),
        )
        .await?;
        drop(writer);

        if downloaded != descriptor.size {
            debug!(
                path = %source_path,
                enumerated = descriptor.size,
                downloaded,
                "File size changed since enumeration"
            );
        }

        let reader = staged
            .reader()
            .map_err(|e| StorageError::Fatal(format!("cannot reopen staging file: {}", e)))?;
        let activity = Activity::new();
        let mut reader = Tracked::new(reader, activity.clone());
        let uploaded = with_idle_timeout(
            self.timeout,
            &activity,
            self.destination.upload(
                destination_path,
                &mut reader,
                downloaded,
                descriptor.modified_time,
            ),
        )
        .await?;

        if uploaded.size != downloaded {
            return Err(StorageError::Transient(format!(
                "destination reports {} bytes for {}, expected {}",
                uploaded.size, destination_path, downloaded
            )));
        }

        Ok(downloaded)
    }
}
