pub mod exclusions;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod retry;
pub mod staging;
pub mod storage;
pub mod transfer_engine;
pub mod verifier;
pub mod walker;

pub use exclusions::ExclusionSet;
pub use models::{
    FileDescriptor, RemotePath, RunSummary, TransferRecord, TransferState, VerificationMethod,
    VerificationResult,
};
pub use orchestrator::{CoordinatorState, Orchestrator, RunReport};
pub use progress::ProgressStore;
pub use report::{RunOutcome, VerificationReport};
pub use retry::{RetryBudget, RetryPolicy};
pub use storage::{ChildEntry, ObjectMetadata, StorageClient};
pub use transfer_engine::{TransferEngine, TransferOutcome};
pub use verifier::Verifier;
pub use walker::{Enumeration, TreeWalker};
