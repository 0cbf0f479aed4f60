use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// A '/'-separated path inside a storage account, held as segments so that
/// prefix checks never match half a folder name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RemotePath {
    segments: Vec<String>,
}

impl RemotePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a path such as `/Documents/2023/` into its segments.
    /// Leading, trailing and repeated slashes are ignored, as is `.`.
    /// Segments are kept verbatim, including surrounding spaces.
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect();
        Self { segments }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Final segment, if any.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<RemotePath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }

    pub fn concat(&self, other: &RemotePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Segment-wise prefix test: `Z_Dropbox` is a prefix of `Z_Dropbox/x.bin`
    /// but not of `Z_Dropbox_old/x.bin`.
    pub fn starts_with(&self, prefix: &RemotePath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments.iter().zip(&prefix.segments).all(|(a, b)| a == b)
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl From<String> for RemotePath {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&str> for RemotePath {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.to_string()
    }
}

/// One migratable file, as seen by the tree walker at enumeration time.
///
/// Identity is the relative path only: two descriptors for the same path are
/// equal even if the file changed size between walks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub relative_path: RemotePath,
    pub size: u64,
    pub source_hash: Option<String>,
    pub modified_time: DateTime<Utc>,
}

impl PartialEq for FileDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.relative_path == other.relative_path
    }
}

impl Eq for FileDescriptor {}

impl Hash for FileDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.relative_path.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Pending,
    InProgress,
    Transferred,
    Verified,
    Failed,
}

impl TransferState {
    /// Whether the progress store accepts a move from `self` to `next`.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;

        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Transferred)
                | (InProgress, Failed)
                // fatal abort mid-file, or resume after a crash
                | (InProgress, Pending)
                | (Transferred, Verified)
                // manual recovery
                | (Failed, Pending)
                | (Transferred, Pending)
        )
    }

    /// Transferred or beyond; the bytes are at the destination.
    pub fn is_transferred(self) -> bool {
        matches!(self, TransferState::Transferred | TransferState::Verified)
    }
}

/// Persisted per-file transfer status. The progress store is the only owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub path: RemotePath,
    pub state: TransferState,
    /// Transfer attempts made so far, across runs.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub destination_path: RemotePath,
    pub size: u64,
    pub source_hash: Option<String>,
    /// Reason of the latest failed verification, cleared when a later one passes.
    #[serde(default)]
    pub mismatch: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn pending(descriptor: &FileDescriptor, destination_root: &RemotePath) -> Self {
        Self {
            path: descriptor.relative_path.clone(),
            state: TransferState::Pending,
            attempts: 0,
            last_error: None,
            destination_path: destination_root.concat(&descriptor.relative_path),
            size: descriptor.size,
            source_hash: descriptor.source_hash.clone(),
            mismatch: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_mismatched(&self) -> bool {
        self.state == TransferState::Transferred && self.mismatch.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Hash,
    /// Hash missing on at least one side; size (and modified time) compared instead
    SizeAndTime,
    Size,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub path: RemotePath,
    pub matched: bool,
    pub method: VerificationMethod,
    pub source_hash: Option<String>,
    pub destination_hash: Option<String>,
    pub source_size: Option<u64>,
    pub destination_size: Option<u64>,
    pub reason: Option<String>,
}

impl VerificationResult {
    /// Anything weaker than a hash comparison.
    pub fn is_low_confidence(&self) -> bool {
        self.method != VerificationMethod::Hash
    }
}

/// Aggregate counts over every record in the progress store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: u64,
    pub pending: u64,
    /// Records whose bytes reached the destination (Transferred or Verified)
    pub transferred: u64,
    pub failed: u64,
    pub verified: u64,
    pub mismatched: u64,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn is_clean(&self) -> bool {
        self.pending == 0 && self.failed == 0 && self.mismatched == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total: {}, transferred: {}, verified: {}, failed: {}, mismatched: {}, pending: {}, elapsed: {:.1}s",
            self.total,
            self.transferred,
            self.verified,
            self.failed,
            self.mismatched,
            self.pending,
            self.elapsed().as_secs_f64()
        )
    }
}
