//! Durable, crash-consistent record of every file's transfer state.
//!
//! The store owns the authoritative `TransferRecord` for each path. Every
//! mutation is validated against the state machine and then checkpointed: the
//! full mapping is written to a sibling temp file, fsynced and renamed over the
//! previous progress file. A crash at any point leaves either the old or the new
//! snapshot on disk, never a torn one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::core::models::{
    FileDescriptor, RemotePath, RunSummary, TransferRecord, TransferState,
};
use crate::error::{MigrationError, Result};

const FORMAT_VERSION: u32 = 1;

/// On-disk layout of the progress file.
#[derive(Debug, Serialize, Deserialize)]
struct ProgressFile {
    version: u32,
    updated_at: DateTime<Utc>,
    summary: RunSummary,
    records: BTreeMap<RemotePath, TransferRecord>,
}

/// What happened when a fresh enumeration was merged into the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub kept: usize,
    pub pruned: usize,
}

pub struct ProgressStore {
    path: PathBuf,
    records: BTreeMap<RemotePath, TransferRecord>,
    started: Instant,
    checkpoints: u64,
}

impl ProgressStore {
    /// Open the store at `path`, resuming from whatever a previous run left.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = Self::load(&path).await?;

        info!(
            progress_file = %path.display(),
            records = records.len(),
            "Progress store loaded"
        );

        Ok(Self {
            path,
            records,
            started: Instant::now(),
            checkpoints: 0,
        })
    }

    /// Read the mapping from disk. A missing file yields an empty mapping.
    ///
    /// Records found `InProgress` belong to an attempt that was interrupted
    /// before its outcome was checkpointed, so they come back as `Pending` with
    /// their attempt counter intact.
    pub async fn load(path: &Path) -> Result<BTreeMap<RemotePath, TransferRecord>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(MigrationError::ProgressIo {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let file: ProgressFile =
            serde_json::from_slice(&bytes).map_err(|source| MigrationError::ProgressCorrupt {
                path: path.to_path_buf(),
                source,
            })?;

        if file.version != FORMAT_VERSION {
            warn!(
                found = file.version,
                expected = FORMAT_VERSION,
                "Progress file written by a different version"
            );
        }

        let mut records = BTreeMap::new();
        for (_, mut record) in file.records {
            if record.state == TransferState::InProgress {
                warn!(
                    path = %record.path,
                    attempts = record.attempts,
                    "Interrupted transfer found, resetting to Pending"
                );
                record.state = TransferState::Pending;
            }
            records.insert(record.path.clone(), record);
        }

        Ok(records)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, path: &RemotePath) -> Option<&TransferRecord> {
        self.records.get(path)
    }

    /// All records in path order.
    pub fn records(&self) -> impl Iterator<Item = &TransferRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of durable writes performed by this process.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints
    }

    /// Insert or replace a record, then checkpoint.
    ///
    /// Rejects moves the state machine does not allow and attempt counters
    /// that would go backwards; both indicate a bug in the caller.
    pub async fn upsert(&mut self, mut record: TransferRecord) -> Result<()> {
        let (from, previous_attempts) = match self.records.get(&record.path) {
            Some(existing) => (existing.state, existing.attempts),
            None => (TransferState::Pending, 0),
        };

        if !from.can_transition_to(record.state) {
            return Err(MigrationError::InvalidTransition {
                path: record.path,
                from,
                to: record.state,
            });
        }
        if record.attempts < previous_attempts {
            return Err(MigrationError::AttemptsDecreased {
                path: record.path,
                from: previous_attempts,
                to: record.attempts,
            });
        }

        debug!(path = %record.path, ?from, to = ?record.state, attempts = record.attempts, "Record updated");

        record.updated_at = Utc::now();
        self.records.insert(record.path.clone(), record);
        self.checkpoint().await
    }

    /// Reconcile the store with a fresh walk of the source.
    ///
    /// Known paths keep their record (refreshing size and hash while still
    /// untransferred), new paths become `Pending`, and records for paths that
    /// no longer exist in the source are dropped. Records under an `unlisted`
    /// folder, one the walk could not read, are kept untouched.
    pub async fn merge_enumeration(
        &mut self,
        descriptors: &[FileDescriptor],
        unlisted: &[RemotePath],
        destination_root: &RemotePath,
    ) -> Result<MergeStats> {
        let mut stats = MergeStats::default();
        let discovered: HashSet<&RemotePath> =
            descriptors.iter().map(|d| &d.relative_path).collect();

        let stale: Vec<RemotePath> = self
            .records
            .keys()
            .filter(|path| !discovered.contains(path))
            .filter(|path| !unlisted.iter().any(|folder| path.starts_with(folder)))
            .cloned()
            .collect();
        for path in stale {
            warn!(path = %path, "File no longer present in source, dropping its record");
            self.records.remove(&path);
            stats.pruned += 1;
        }

        for descriptor in descriptors {
            match self.records.get_mut(&descriptor.relative_path) {
                Some(existing) => {
                    if !existing.state.is_transferred() {
                        existing.size = descriptor.size;
                        existing.source_hash = descriptor.source_hash.clone();
                    }
                    existing.destination_path = destination_root.concat(&descriptor.relative_path);
                    stats.kept += 1;
                }
                None => {
                    self.records.insert(
                        descriptor.relative_path.clone(),
                        TransferRecord::pending(descriptor, destination_root),
                    );
                    stats.added += 1;
                }
            }
        }

        info!(
            added = stats.added,
            kept = stats.kept,
            pruned = stats.pruned,
            "Work list merged into progress store"
        );

        self.checkpoint().await?;
        Ok(stats)
    }

    /// Manual recovery: put Failed records (and, if asked, records whose last
    /// verification mismatched) back to Pending with a fresh attempt counter.
    pub async fn reset(&mut self, include_mismatched: bool) -> Result<usize> {
        let mut count = 0;
        for record in self.records.values_mut() {
            let eligible = record.state == TransferState::Failed
                || (include_mismatched && record.is_mismatched());
            if !eligible {
                continue;
            }
            record.state = TransferState::Pending;
            record.attempts = 0;
            record.last_error = None;
            record.mismatch = None;
            record.updated_at = Utc::now();
            count += 1;
        }

        if count > 0 {
            self.checkpoint().await?;
        }
        info!(records = count, "Records reset to Pending");
        Ok(count)
    }

    /// Aggregate counts over every record.
    pub fn snapshot(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.records.len() as u64,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            ..RunSummary::default()
        };

        for record in self.records.values() {
            match record.state {
                TransferState::Pending | TransferState::InProgress => summary.pending += 1,
                TransferState::Failed => summary.failed += 1,
                TransferState::Transferred => {
                    summary.transferred += 1;
                    if record.mismatch.is_some() {
                        summary.mismatched += 1;
                    }
                }
                TransferState::Verified => {
                    summary.transferred += 1;
                    summary.verified += 1;
                }
            }
        }

        summary
    }

    /// Write the full mapping durably.
    pub async fn checkpoint(&mut self) -> Result<()> {
        let file = ProgressFile {
            version: FORMAT_VERSION,
            updated_at: Utc::now(),
            summary: self.snapshot(),
            records: self.records.clone(),
        };

        let bytes = serde_json::to_vec_pretty(&file).map_err(|source| {
            MigrationError::ProgressCorrupt {
                path: self.path.clone(),
                source,
            }
        })?;

        write_atomic(&self.path, &bytes)
            .await
            .map_err(|source| MigrationError::ProgressIo {
                path: self.path.clone(),
                source,
            })?;

        self.checkpoints += 1;
        Ok(())
    }
}

/// Replace `path` with `bytes` via write-temp, fsync, rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = temp_sibling(path);

    let mut tmp = tokio::fs::File::create(&tmp_path).await?;
    tmp.write_all(bytes).await?;
    tmp.sync_all().await?;
    drop(tmp);

    tokio::fs::rename(&tmp_path, path).await?;

    // Persist the rename itself; not every platform lets us fsync a directory.
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        match tokio::fs::File::open(parent).await {
            Ok(dir) => {
                if let Err(e) = dir.sync_all().await {
                    debug!(dir = %parent.display(), error = %e, "Directory fsync failed");
                }
            }
            Err(e) => debug!(dir = %parent.display(), error = %e, "Cannot open directory for fsync"),
        }
    }

    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "progress".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn descriptor(path: &str, size: u64) -> FileDescriptor {
        FileDescriptor {
            relative_path: RemotePath::parse(path),
            size,
            source_hash: Some(format!("hash-{}", path)),
            modified_time: Utc::now(),
        }
    }

    async fn store_with(dir: &Path, paths: &[&str]) -> ProgressStore {
        let mut store = ProgressStore::open(dir.join("progress.json")).await.unwrap();
        let descriptors: Vec<_> = paths.iter().map(|p| descriptor(p, 10)).collect();
        store
            .merge_enumeration(&descriptors, &[], &RemotePath::parse("Dest"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let temp = tempdir().unwrap();
        let records = ProgressStore::load(&temp.path().join("nope.json")).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_is_persisted_and_reloaded() {
        let temp = tempdir().unwrap();
        let mut store = store_with(temp.path(), &["a.txt", "dir/b.txt"]).await;

        let mut record = store.get(&RemotePath::parse("a.txt")).unwrap().clone();
        record.state = TransferState::InProgress;
        record.attempts = 1;
        store.upsert(record.clone()).await.unwrap();
        record.state = TransferState::Transferred;
        store.upsert(record).await.unwrap();

        let reopened = ProgressStore::open(temp.path().join("progress.json")).await.unwrap();
        assert_eq!(reopened.len(), 2);
        let a = reopened.get(&RemotePath::parse("a.txt")).unwrap();
        assert_eq!(a.state, TransferState::Transferred);
        assert_eq!(a.attempts, 1);
        assert_eq!(a.destination_path.to_string(), "Dest/a.txt");

        // no temp file left behind after the rename
        assert!(!temp.path().join("progress.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_in_progress_coerced_to_pending_on_load() {
        let temp = tempdir().unwrap();
        let mut store = store_with(temp.path(), &["a.txt"]).await;

        let mut record = store.get(&RemotePath::parse("a.txt")).unwrap().clone();
        record.state = TransferState::InProgress;
        record.attempts = 2;
        store.upsert(record).await.unwrap();
        drop(store);

        let reopened = ProgressStore::open(temp.path().join("progress.json")).await.unwrap();
        let a = reopened.get(&RemotePath::parse("a.txt")).unwrap();
        assert_eq!(a.state, TransferState::Pending);
        assert_eq!(a.attempts, 2);
        assert!(reopened.records().all(|r| r.state != TransferState::InProgress));
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let temp = tempdir().unwrap();
        let mut store = store_with(temp.path(), &["a.txt"]).await;

        let mut record = store.get(&RemotePath::parse("a.txt")).unwrap().clone();
        record.state = TransferState::Verified;
        let err = store.upsert(record).await.unwrap_err();
        assert!(matches!(err, MigrationError::InvalidTransition { .. }));

        // the rejected update never reached the store
        assert_eq!(
            store.get(&RemotePath::parse("a.txt")).unwrap().state,
            TransferState::Pending
        );
    }

    #[tokio::test]
    async fn test_attempts_cannot_decrease() {
        let temp = tempdir().unwrap();
        let mut store = store_with(temp.path(), &["a.txt"]).await;

        let mut record = store.get(&RemotePath::parse("a.txt")).unwrap().clone();
        record.state = TransferState::InProgress;
        record.attempts = 3;
        store.upsert(record.clone()).await.unwrap();

        record.attempts = 1;
        let err = store.upsert(record).await.unwrap_err();
        assert!(matches!(err, MigrationError::AttemptsDecreased { from: 3, to: 1, .. }));
    }

    #[tokio::test]
    async fn test_repeated_merge_never_duplicates() {
        let temp = tempdir().unwrap();
        let mut store = store_with(temp.path(), &["a.txt", "b.txt"]).await;

        let descriptors = vec![descriptor("a.txt", 10), descriptor("b.txt", 10)];
        for _ in 0..3 {
            let stats = store
                .merge_enumeration(&descriptors, &[], &RemotePath::parse("Dest"))
                .await
                .unwrap();
            assert_eq!(stats.added, 0);
            assert_eq!(stats.kept, 2);
        }
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_merge_prunes_removed_and_keeps_state() {
        let temp = tempdir().unwrap();
        let mut store = store_with(temp.path(), &["a.txt", "gone.txt"]).await;

        let mut record = store.get(&RemotePath::parse("a.txt")).unwrap().clone();
        record.state = TransferState::InProgress;
        record.attempts = 1;
        store.upsert(record.clone()).await.unwrap();
        record.state = TransferState::Transferred;
        store.upsert(record).await.unwrap();

        let stats = store
            .merge_enumeration(
                &[descriptor("a.txt", 10), descriptor("new.txt", 4)],
                &[],
                &RemotePath::parse("Dest"),
            )
            .await
            .unwrap();

        assert_eq!(stats, MergeStats { added: 1, kept: 1, pruned: 1 });
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.get(&RemotePath::parse("a.txt")).unwrap().state,
            TransferState::Transferred
        );
        assert!(store.get(&RemotePath::parse("gone.txt")).is_none());
    }

    #[tokio::test]
    async fn test_merge_keeps_records_under_unlisted_folder() {
        let temp = tempdir().unwrap();
        let mut store = store_with(temp.path(), &["a.txt", "photos/b.jpg", "photosets/c.jpg"]).await;

        let mut record = store.get(&RemotePath::parse("photos/b.jpg")).unwrap().clone();
        record.state = TransferState::InProgress;
        record.attempts = 1;
        store.upsert(record.clone()).await.unwrap();
        record.state = TransferState::Transferred;
        store.upsert(record).await.unwrap();

        let stats = store
            .merge_enumeration(
                &[descriptor("a.txt", 10)],
                &[RemotePath::parse("photos")],
                &RemotePath::parse("Dest"),
            )
            .await
            .unwrap();

        assert_eq!(stats, MergeStats { added: 0, kept: 1, pruned: 1 });
        assert_eq!(
            store.get(&RemotePath::parse("photos/b.jpg")).unwrap().state,
            TransferState::Transferred
        );
        assert!(store.get(&RemotePath::parse("photosets/c.jpg")).is_none());
    }

    #[tokio::test]
    async fn test_reset_failed_and_mismatched() {
        let temp = tempdir().unwrap();
        let mut store = store_with(temp.path(), &["bad.txt", "odd.txt", "ok.txt"]).await;

        for (path, end) in [
            ("bad.txt", TransferState::Failed),
            ("odd.txt", TransferState::Transferred),
            ("ok.txt", TransferState::Transferred),
        ] {
            let mut record = store.get(&RemotePath::parse(path)).unwrap().clone();
            record.state = TransferState::InProgress;
            record.attempts = 4;
            store.upsert(record.clone()).await.unwrap();
            record.state = end;
            if path == "odd.txt" {
                record.mismatch = Some("hash mismatch".into());
            }
            store.upsert(record).await.unwrap();
        }

        assert_eq!(store.reset(false).await.unwrap(), 1);
        let bad = store.get(&RemotePath::parse("bad.txt")).unwrap();
        assert_eq!(bad.state, TransferState::Pending);
        assert_eq!(bad.attempts, 0);

        assert_eq!(store.reset(true).await.unwrap(), 1);
        assert_eq!(
            store.get(&RemotePath::parse("odd.txt")).unwrap().state,
            TransferState::Pending
        );
        assert_eq!(
            store.get(&RemotePath::parse("ok.txt")).unwrap().state,
            TransferState::Transferred
        );
    }

    #[tokio::test]
    async fn test_snapshot_counts() {
        let temp = tempdir().unwrap();
        let mut store = store_with(temp.path(), &["a", "b", "c", "d"]).await;

        let steps = [
            ("a", vec![TransferState::InProgress, TransferState::Transferred, TransferState::Verified]),
            ("b", vec![TransferState::InProgress, TransferState::Failed]),
            ("c", vec![TransferState::InProgress, TransferState::Transferred]),
        ];
        for (path, states) in steps {
            for state in states {
                let mut record = store.get(&RemotePath::parse(path)).unwrap().clone();
                record.state = state;
                store.upsert(record).await.unwrap();
            }
        }

        let summary = store.snapshot();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.transferred, 2);
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.mismatched, 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("progress.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = ProgressStore::open(&path).await.err().unwrap();
        assert!(matches!(err, MigrationError::ProgressCorrupt { .. }));
    }
}
