//! Error types for cloudmig.
//!
//! `StorageError` is what a single storage call can fail with. `MigrationError` is
//! reserved for conditions that end the run; per-file problems never become one.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::models::{RemotePath, TransferState};

/// Failure of a single Storage Client call.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The provider asked us to slow down (HTTP 429).
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// Network hiccup, 5xx, connection reset and friends.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Credentials irrecoverable, account gone, disk full.
    #[error("fatal storage failure: {0}")]
    Fatal(String),
}

/// How the orchestrator reacts to a `StorageError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a delay
    Transient,
    /// Retrying will not help; the file is marked Failed
    Permanent,
    /// The run cannot continue
    Fatal,
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } | Self::Transient(_) | Self::Timeout(_) => {
                ErrorClass::Transient
            }
            Self::NotFound(_) | Self::PermissionDenied(_) => ErrorClass::Permanent,
            Self::Fatal(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Conditions that halt a migration run.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("source root '{0}' does not exist")]
    SourceRootNotFound(RemotePath),

    #[error("source root '{root}' is not accessible: {source}")]
    SourceInaccessible {
        root: RemotePath,
        #[source]
        source: StorageError,
    },

    #[error("destination root '{root}' is not accessible: {source}")]
    DestinationInaccessible {
        root: RemotePath,
        #[source]
        source: StorageError,
    },

    #[error("unrecoverable storage failure at '{path}': {source}")]
    Storage {
        path: RemotePath,
        #[source]
        source: StorageError,
    },

    #[error("progress file I/O error at '{}': {source}", path.display())]
    ProgressIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("progress file '{}' is corrupt: {source}", path.display())]
    ProgressCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("staging directory '{}' is unusable: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write verification report '{}': {source}", path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("illegal state transition for '{path}': {from:?} -> {to:?}")]
    InvalidTransition {
        path: RemotePath,
        from: TransferState,
        to: TransferState,
    },

    #[error("attempt counter for '{path}' would decrease from {from} to {to}")]
    AttemptsDecreased { path: RemotePath, from: u32, to: u32 },

    #[error("no transfer record for '{0}'")]
    UnknownRecord(RemotePath),

    #[error("cannot verify '{path}' in state {state:?}; only Transferred records are eligible")]
    NotTransferred {
        path: RemotePath,
        state: TransferState,
    },

    #[error("global retry budget of {0} retries exhausted")]
    RetryBudgetExhausted(u32),
}

pub type Result<T, E = MigrationError> = std::result::Result<T, E>;
