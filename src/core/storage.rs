//! The narrow interface the orchestrator needs from a storage account.
//!
//! Authentication is not part of this seam: an implementation that talks to a
//! remote provider acquires and refreshes its own credentials before a call and
//! reports an irrecoverable credential as `StorageError::Fatal`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::core::models::RemotePath;
use crate::error::StorageError;

/// An entry returned when listing a folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub name: String,
    pub is_folder: bool,
    pub size: u64,
    pub hash: Option<String>,
    pub modified_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub size: u64,
    pub hash: Option<String>,
    pub modified_time: DateTime<Utc>,
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// List the direct children of a folder.
    async fn list_children(&self, folder: &RemotePath) -> Result<Vec<ChildEntry>, StorageError>;

    /// Stream an object's bytes into `sink`. Returns the number of bytes written.
    async fn download(
        &self,
        path: &RemotePath,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, StorageError>;

    /// Store `size` bytes read from `source` at `path`, creating missing parent
    /// folders and replacing any existing object. `modified_time` carries the
    /// source timestamp over where the backend supports it.
    async fn upload(
        &self,
        path: &RemotePath,
        source: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
        modified_time: DateTime<Utc>,
    ) -> Result<ObjectMetadata, StorageError>;

    async fn metadata(&self, path: &RemotePath) -> Result<ObjectMetadata, StorageError>;
}

/// Run a storage call with a bounded wait. Overrunning counts as a transient
/// failure, not a fatal one.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout(limit)),
    }
}

/// Slowest rate a whole-object call such as `metadata` is assumed to
/// process bytes at when sizing its time limit.
const MIN_THROUGHPUT_BYTES_PER_SEC: u64 = 1024 * 1024;

/// Time limit for a call that has to read an entire object of `size` bytes:
/// the base `limit` plus an allowance at the minimum throughput.
pub fn size_scaled_timeout(limit: Duration, size: u64) -> Duration {
    limit + Duration::from_secs(size / MIN_THROUGHPUT_BYTES_PER_SEC)
}

/// When bytes last moved through a [`Tracked`] stream.
#[derive(Debug, Clone)]
pub struct Activity {
    started: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last byte moved, or since creation if none has.
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that records every successful read or write in an [`Activity`].
pub struct Tracked<S> {
    inner: S,
    activity: Activity,
}

impl<S> Tracked<S> {
    pub fn new(inner: S, activity: Activity) -> Self {
        Self { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.touch();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            this.activity.touch();
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Run a streaming call that may take as long as it needs while bytes keep
/// moving. It fails with `StorageError::Timeout` only once `activity` has been
/// idle for `limit`.
pub async fn with_idle_timeout<T, F>(
    limit: Duration,
    activity: &Activity,
    call: F,
) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    tokio::pin!(call);
    loop {
        let idle = activity.idle();
        if idle >= limit {
            return Err(StorageError::Timeout(limit));
        }
        if let Ok(result) = tokio::time::timeout(limit - idle, &mut call).await {
            return result;
        }
    }
}
