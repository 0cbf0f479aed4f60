use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudmig::adapters::{SimulatedOp, SimulatedStorage};
use cloudmig::config::AppConfig;
use cloudmig::context::MigrationContext;
use cloudmig::core::{
    ChildEntry, ObjectMetadata, Orchestrator, ProgressStore, RemotePath, RunOutcome,
    StorageClient, TransferState,
};
use cloudmig::error::StorageError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

const FILES: [(&str, &[u8]); 4] = [
    ("A/doc.txt", b"0123456789"),
    ("A/notes/todo.md", b"- migrate\n"),
    ("A/photos/beach.jpg", b"\x89PNG beach"),
    ("A/photos/sunset.jpg", b"\x89PNG sunset"),
];

/// Relative paths in walk order.
const WALK_ORDER: [&str; 4] = [
    "doc.txt",
    "notes/todo.md",
    "photos/beach.jpg",
    "photos/sunset.jpg",
];

fn config(work_dir: &Path) -> AppConfig {
    AppConfig {
        source_root: "A".into(),
        destination_root: "Migrated".into(),
        batch_size: 2,
        retry_attempts: 2,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 2,
        progress_file: work_dir.join("progress.json"),
        report_dir: work_dir.join("reports"),
        staging_dir: Some(work_dir.join("staging")),
        ..AppConfig::default()
    }
}

fn source_tree() -> Arc<SimulatedStorage> {
    let source = Arc::new(SimulatedStorage::new());
    for (path, data) in FILES {
        source.put_file(path, data);
    }
    source
}

async fn orchestrator(
    ctx: MigrationContext,
    source: Arc<dyn StorageClient>,
    destination: Arc<dyn StorageClient>,
) -> Orchestrator {
    Orchestrator::new(ctx, source, destination)
        .await
        .expect("orchestrator setup")
}

fn states(orchestrator: &Orchestrator) -> BTreeMap<String, TransferState> {
    orchestrator
        .store()
        .records()
        .map(|r| (r.path.to_string(), r.state))
        .collect()
}

/// Rewrite one record in the progress file as if the process died right
/// after marking it `InProgress`.
fn mark_in_progress(progress_file: &Path, path: &str) {
    let mut json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(progress_file).unwrap()).unwrap();
    json["records"][path]["state"] = serde_json::Value::from("InProgress");
    std::fs::write(progress_file, serde_json::to_vec_pretty(&json).unwrap()).unwrap();
}

#[tokio::test]
async fn test_interrupted_run_resumes_to_same_end_state() {
    let baseline = {
        let temp = tempdir().unwrap();
        let mut o = orchestrator(
            MigrationContext::new(config(temp.path())),
            source_tree(),
            Arc::new(SimulatedStorage::new()),
        )
        .await;
        let report = o.run().await;
        assert_eq!(report.outcome, RunOutcome::Completed);
        states(&o)
    };

    for (index, victim) in WALK_ORDER.iter().enumerate() {
        let temp = tempdir().unwrap();
        let source = source_tree();
        let destination = Arc::new(SimulatedStorage::new());
        let victim_destination = format!("Migrated/{}", victim);

        // A fatal upload error stops the run mid-file, at the same point a
        // crash during the upload would.
        destination.fail_upload(
            &victim_destination,
            StorageError::Fatal("connection to account lost".into()),
            1,
        );
        let mut first = orchestrator(
            MigrationContext::new(config(temp.path())),
            source.clone(),
            destination.clone(),
        )
        .await;
        let report = first.run().await;
        assert!(matches!(report.outcome, RunOutcome::Halted(_)));
        assert_eq!(
            states(&first)[*victim],
            TransferState::Pending,
            "victim {} left in a non-resumable state",
            victim
        );
        let done_before = states(&first)
            .values()
            .filter(|s| s.is_transferred())
            .count();
        assert_eq!(done_before, index);
        drop(first);

        mark_in_progress(&temp.path().join("progress.json"), victim);

        let mut second = orchestrator(
            MigrationContext::new(config(temp.path())),
            source.clone(),
            destination.clone(),
        )
        .await;
        let report = second.run().await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(states(&second), baseline, "after interrupting at {}", victim);
        assert_eq!(
            second
                .store()
                .get(&RemotePath::parse(victim))
                .unwrap()
                .attempts,
            2
        );
        for (path, data) in FILES {
            let target = path.replacen("A/", "Migrated/", 1);
            assert_eq!(destination.read_file(&target).as_deref(), Some(data));
        }
        // files finished before the interruption were not uploaded again
        assert_eq!(destination.total_calls(SimulatedOp::Upload), FILES.len() + 1);
    }
}

#[tokio::test]
async fn test_in_progress_record_never_survives_a_run() {
    let temp = tempdir().unwrap();
    let source = source_tree();
    let destination = Arc::new(SimulatedStorage::new());
    destination.fail_upload(
        "Migrated/photos/beach.jpg",
        StorageError::Fatal("disk full".into()),
        1,
    );

    let mut o = orchestrator(
        MigrationContext::new(config(temp.path())),
        source,
        destination,
    )
    .await;
    o.run().await;
    drop(o);

    let on_disk = ProgressStore::load(&temp.path().join("progress.json"))
        .await
        .unwrap();
    assert!(
        on_disk
            .values()
            .all(|r| r.state != TransferState::InProgress)
    );
    let raw = std::fs::read_to_string(temp.path().join("progress.json")).unwrap();
    assert!(!raw.contains("\"InProgress\""));
}

/// Passes everything through and cancels the run once the first upload lands.
struct CancelAfterUpload {
    inner: Arc<SimulatedStorage>,
    token: CancellationToken,
}

#[async_trait]
impl StorageClient for CancelAfterUpload {
    async fn list_children(&self, folder: &RemotePath) -> Result<Vec<ChildEntry>, StorageError> {
        self.inner.list_children(folder).await
    }

    async fn download(
        &self,
        path: &RemotePath,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, StorageError> {
        self.inner.download(path, sink).await
    }

    async fn upload(
        &self,
        path: &RemotePath,
        source: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
        modified_time: DateTime<Utc>,
    ) -> Result<ObjectMetadata, StorageError> {
        let result = self.inner.upload(path, source, size, modified_time).await;
        self.token.cancel();
        result
    }

    async fn metadata(&self, path: &RemotePath) -> Result<ObjectMetadata, StorageError> {
        self.inner.metadata(path).await
    }
}

#[tokio::test]
async fn test_cancellation_finishes_current_file_then_stops() {
    let temp = tempdir().unwrap();
    let source = source_tree();
    let destination = Arc::new(SimulatedStorage::new());

    let ctx = MigrationContext::new(config(temp.path()));
    let wrapper = Arc::new(CancelAfterUpload {
        inner: destination.clone(),
        token: ctx.cancel.clone(),
    });
    let mut o = orchestrator(ctx, source.clone(), wrapper).await;
    let report = o.run().await;

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.files_transferred, 1);
    assert_eq!(destination.total_calls(SimulatedOp::Upload), 1);
    assert_eq!(states(&o)["doc.txt"], TransferState::Transferred);
    assert_eq!(report.summary.pending, 3);
    assert!(report.report_path.is_some());
    drop(o);

    let mut resumed = orchestrator(
        MigrationContext::new(config(temp.path())),
        source,
        destination.clone(),
    )
    .await;
    let report = resumed.run().await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.summary.verified, 4);
    assert_eq!(destination.total_calls(SimulatedOp::Upload), 4);
}

#[tokio::test]
async fn test_cancelled_before_start_transfers_nothing() {
    let temp = tempdir().unwrap();
    let source = source_tree();
    let destination = Arc::new(SimulatedStorage::new());

    let ctx = MigrationContext::new(config(temp.path()));
    ctx.cancel.cancel();
    let mut o = orchestrator(ctx, source, destination.clone()).await;
    let report = o.run().await;

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(destination.total_calls(SimulatedOp::Upload), 0);
    assert_eq!(report.summary.total, 4);
    assert_eq!(report.summary.pending, 4);
}
