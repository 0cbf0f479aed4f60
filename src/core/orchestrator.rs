//! Drives a migration run end to end.
//!
//! Enumerate the source, merge the work list into the progress store, then
//! walk it in batches: transfer every `Pending` file of the batch, then verify
//! the batch's `Transferred` files. Batches are recomputed from the sorted
//! work list on every run, so a resumed run skips straight past batches that
//! have nothing left to do.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::context::MigrationContext;
use crate::core::models::{FileDescriptor, RemotePath, RunSummary, TransferState, VerificationResult};
use crate::core::progress::ProgressStore;
use crate::core::report::{RunOutcome, VerificationReport};
use crate::core::retry::call_with_retry;
use crate::core::staging::StagingArea;
use crate::core::storage::StorageClient;
use crate::core::transfer_engine::{TransferEngine, TransferOutcome};
use crate::core::verifier::{Verifier, log_batch_results};
use crate::core::walker::TreeWalker;
use crate::error::{ErrorClass, MigrationError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Enumerating,
    Running(usize),
    Verifying(usize),
    Completed,
    Halted(String),
}

/// Everything a caller needs to know about a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub summary: RunSummary,
    pub verification: Vec<VerificationResult>,
    /// Bytes moved by this run only
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    /// Source folders that could not be listed; their files were not migrated
    pub skipped_folders: Vec<RemotePath>,
    pub report_path: Option<PathBuf>,
}

impl RunReport {
    /// Process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Halted(_) => 1,
            RunOutcome::Cancelled => 3,
            RunOutcome::Completed
                if self.summary.failed > 0
                    || self.summary.mismatched > 0
                    || !self.skipped_folders.is_empty() =>
            {
                2
            }
            RunOutcome::Completed => 0,
        }
    }
}

/// Why the batch loop stopped early.
enum Stop {
    Cancelled,
    Halted(MigrationError),
}

pub struct Orchestrator {
    ctx: MigrationContext,
    source: Arc<dyn StorageClient>,
    destination: Arc<dyn StorageClient>,
    store: ProgressStore,
    engine: TransferEngine,
    verifier: Verifier,
    state: CoordinatorState,
    history: Vec<CoordinatorState>,
    bytes_transferred: u64,
    files_transferred: u64,
    skipped_folders: Vec<RemotePath>,
    results: Vec<VerificationResult>,
}

impl Orchestrator {
    /// Open the progress store and staging area for a run over the two accounts.
    pub async fn new(
        ctx: MigrationContext,
        source: Arc<dyn StorageClient>,
        destination: Arc<dyn StorageClient>,
    ) -> Result<Self> {
        let store = ProgressStore::open(ctx.config.progress_file.clone()).await?;
        let staging = StagingArea::new(ctx.config.staging_dir.clone()).map_err(|source| {
            MigrationError::Staging {
                path: ctx.config.staging_dir.clone().unwrap_or_else(std::env::temp_dir),
                source,
            }
        })?;

        let engine = TransferEngine::new(&ctx, source.clone(), destination.clone(), staging);
        let verifier = Verifier::new(&ctx, source.clone(), destination.clone());

        Ok(Self {
            ctx,
            source,
            destination,
            store,
            engine,
            verifier,
            state: CoordinatorState::Idle,
            history: vec![CoordinatorState::Idle],
            bytes_transferred: 0,
            files_transferred: 0,
            skipped_folders: Vec::new(),
            results: Vec::new(),
        })
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    /// Every state this coordinator has been in, oldest first.
    pub fn history(&self) -> &[CoordinatorState] {
        &self.history
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    /// Execute the run. Always ends with a summary and a written report,
    /// whether the run completed, was cancelled or halted.
    pub async fn run(&mut self) -> RunReport {
        let span = info_span!("migration_run", run_id = %self.ctx.run_id);
        async {
            let start_time = Instant::now();
            info!(
                source = %self.ctx.config.source_account.display(),
                destination = %self.ctx.config.destination_account.display(),
                source_root = %self.ctx.config.source_root(),
                destination_root = %self.ctx.config.destination_root(),
                "Starting migration run"
            );

            let outcome = match self.execute().await {
                Ok(()) => {
                    self.transition(CoordinatorState::Completed);
                    RunOutcome::Completed
                }
                Err(Stop::Cancelled) => {
                    warn!("Run cancelled, no further files will be started");
                    self.transition(CoordinatorState::Halted("cancelled".to_string()));
                    RunOutcome::Cancelled
                }
                Err(Stop::Halted(e)) => {
                    error!(error = %e, "Migration halted");
                    self.transition(CoordinatorState::Halted(e.to_string()));
                    RunOutcome::Halted(e.to_string())
                }
            };

            let report = self.finish(outcome).await;
            info!(
                outcome = ?report.outcome,
                summary = %report.summary,
                bytes = report.bytes_transferred,
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "Migration run finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn execute(&mut self) -> std::result::Result<(), Stop> {
        self.transition(CoordinatorState::Enumerating);
        let work = self.prepare().await.map_err(Stop::Halted)?;

        let batch_size = self.ctx.config.batch_size.max(1);
        let batch_count = work.len().div_ceil(batch_size);
        let destination_root = self.ctx.config.destination_root();

        for (index, batch) in work.chunks(batch_size).enumerate() {
            if self.ctx.is_cancelled() {
                return Err(Stop::Cancelled);
            }

            let pending: Vec<&FileDescriptor> = batch
                .iter()
                .filter(|d| self.state_of(&d.relative_path) == Some(TransferState::Pending))
                .collect();
            let unverified = batch
                .iter()
                .any(|d| self.state_of(&d.relative_path) == Some(TransferState::Transferred));

            if pending.is_empty() && !(unverified && self.ctx.config.verify_after_transfer) {
                debug!(batch = index, "Batch has nothing left to do");
                continue;
            }

            self.transition(CoordinatorState::Running(index));
            info!(
                batch = index + 1,
                of = batch_count,
                files = pending.len(),
                "Processing batch"
            );

            for descriptor in pending {
                if self.ctx.is_cancelled() {
                    return Err(Stop::Cancelled);
                }

                let span = info_span!("transfer", path = %descriptor.relative_path);
                let outcome = self
                    .engine
                    .transfer(&mut self.store, descriptor, &destination_root)
                    .instrument(span)
                    .await
                    .map_err(Stop::Halted)?;

                if let TransferOutcome::Success { bytes } = outcome {
                    self.bytes_transferred += bytes;
                    self.files_transferred += 1;
                }

                if self.ctx.budget.was_denied() {
                    return Err(Stop::Halted(MigrationError::RetryBudgetExhausted(
                        self.ctx.budget.spent(),
                    )));
                }
            }

            if self.ctx.config.verify_after_transfer {
                self.verify_batch(index, batch).await?;
            }
        }

        Ok(())
    }

    /// Check both accounts, enumerate the source and merge the result into
    /// the progress store. Returns the work list in walk order.
    async fn prepare(&mut self) -> Result<Vec<FileDescriptor>> {
        self.probe_destination().await?;

        let exclusions = self.ctx.config.exclusions();
        let walker = TreeWalker::new(
            self.source.as_ref(),
            &exclusions,
            self.ctx.policy,
            &self.ctx.budget,
            self.ctx.config.operation_timeout(),
        );
        let walk = walker.enumerate(&self.ctx.config.source_root()).await?;

        self.store
            .merge_enumeration(
                &walk.files,
                &walk.skipped_folders,
                &self.ctx.config.destination_root(),
            )
            .await?;
        self.skipped_folders = walk.skipped_folders;

        let summary = self.store.snapshot();
        info!(
            files = walk.files.len(),
            pending = summary.pending,
            already_transferred = summary.transferred,
            failed = summary.failed,
            skipped_folders = self.skipped_folders.len(),
            "Work list ready"
        );
        Ok(walk.files)
    }

    /// The destination root may not exist yet, but its account must be reachable.
    /// Only a permanent answer halts the run; a transient one is left for the
    /// per-file retries to deal with.
    async fn probe_destination(&self) -> Result<()> {
        let root = self.ctx.config.destination_root();
        let client = self.destination.as_ref();
        let folder = &root;
        let probe = call_with_retry(
            &self.ctx.policy,
            &self.ctx.budget,
            self.ctx.config.operation_timeout(),
            "list_children",
            folder,
            move || client.list_children(folder),
        )
        .await;

        match probe {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() && !root.is_root() => {
                debug!(root = %root, "Destination root does not exist yet, it will be created");
                Ok(())
            }
            Err(e) if e.class() == ErrorClass::Transient => {
                warn!(root = %root, error = %e, "Destination probe inconclusive, continuing");
                Ok(())
            }
            Err(source) => Err(MigrationError::DestinationInaccessible { root, source }),
        }
    }

    async fn verify_batch(
        &mut self,
        index: usize,
        batch: &[FileDescriptor],
    ) -> std::result::Result<(), Stop> {
        let to_verify: Vec<RemotePath> = batch
            .iter()
            .filter(|d| self.state_of(&d.relative_path) == Some(TransferState::Transferred))
            .map(|d| d.relative_path.clone())
            .collect();
        if to_verify.is_empty() {
            return Ok(());
        }

        self.transition(CoordinatorState::Verifying(index));
        let mut batch_results = Vec::with_capacity(to_verify.len());
        for path in &to_verify {
            if self.ctx.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            let result = self
                .verifier
                .verify(&mut self.store, path)
                .await
                .map_err(Stop::Halted)?;
            batch_results.push(result);
        }

        log_batch_results(index + 1, &batch_results);
        self.results.extend(batch_results);
        Ok(())
    }

    /// Persist the final summary and write the report. Failures here are
    /// logged rather than returned so the caller still gets its summary.
    async fn finish(&mut self, outcome: RunOutcome) -> RunReport {
        if let Err(e) = self.store.checkpoint().await {
            error!(error = %e, "Failed to write final progress checkpoint");
        }

        let report = VerificationReport::build(
            self.ctx.run_id,
            outcome.clone(),
            &self.store,
            self.bytes_transferred,
            self.results.clone(),
            self.skipped_folders.clone(),
        );
        let report_path = match report.write(&self.ctx.config.report_dir).await {
            Ok(path) => Some(path),
            Err(e) => {
                error!(error = %e, "Failed to write verification report");
                None
            }
        };

        RunReport {
            run_id: self.ctx.run_id,
            outcome,
            summary: report.summary,
            verification: report.results,
            bytes_transferred: self.bytes_transferred,
            files_transferred: self.files_transferred,
            skipped_folders: report.skipped_folders,
            report_path,
        }
    }

    fn state_of(&self, path: &RemotePath) -> Option<TransferState> {
        self.store.get(path).map(|r| r.state)
    }

    fn transition(&mut self, next: CoordinatorState) {
        debug!(from = ?self.state, to = ?next, "Coordinator state change");
        self.state = next.clone();
        self.history.push(next);
    }
}
