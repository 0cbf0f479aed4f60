//! Exclusion-aware enumeration of the source account.
//!
//! The walk is depth-first and deterministic: within a folder, files are emitted
//! in name order before descending into subfolders, also in name order. The same
//! source tree therefore always produces the same work list, which is what lets a
//! resumed run recompute its batches instead of persisting them.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::exclusions::ExclusionSet;
use crate::core::models::{FileDescriptor, RemotePath};
use crate::core::retry::{RetryBudget, RetryPolicy, call_with_retry};
use crate::core::storage::{ChildEntry, StorageClient};
use crate::error::{ErrorClass, MigrationError, Result, StorageError};
use crate::logging::LogThrottle;

/// Result of one walk over the source tree.
#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    /// Files in walk order
    pub files: Vec<FileDescriptor>,
    /// Subfolders, relative to the root, whose contents could not be listed
    pub skipped_folders: Vec<RemotePath>,
}

pub struct TreeWalker<'a> {
    client: &'a dyn StorageClient,
    exclusions: &'a ExclusionSet,
    policy: RetryPolicy,
    budget: &'a RetryBudget,
    timeout: Duration,
}

impl<'a> TreeWalker<'a> {
    pub fn new(
        client: &'a dyn StorageClient,
        exclusions: &'a ExclusionSet,
        policy: RetryPolicy,
        budget: &'a RetryBudget,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            exclusions,
            policy,
            budget,
            timeout,
        }
    }

    /// Enumerate every non-excluded file under `root`.
    ///
    /// Paths in the returned descriptors are relative to `root`. A missing or
    /// unreadable root is fatal. A subfolder that disappears or is unreadable
    /// mid-walk is skipped with a warning and reported in
    /// [`Enumeration::skipped_folders`]; the rest of the tree is still walked.
    pub async fn enumerate(&self, root: &RemotePath) -> Result<Enumeration> {
        info!(root = %root, exclusions = self.exclusions.prefixes().len(), "Enumerating source tree");

        let mut descriptors = Vec::new();
        let mut skipped_folders = Vec::new();
        let mut folders_listed: u64 = 0;
        let mut throttle = LogThrottle::new(Duration::from_secs(5));

        // Relative folder paths still to visit; popped from the end.
        let mut stack: Vec<RemotePath> = vec![RemotePath::root()];

        while let Some(relative) = stack.pop() {
            let absolute = root.concat(&relative);

            let mut children = match self.list(&absolute).await {
                Ok(children) => children,
                Err(e) if relative.is_root() => {
                    return Err(if e.is_not_found() {
                        MigrationError::SourceRootNotFound(root.clone())
                    } else {
                        MigrationError::SourceInaccessible {
                            root: root.clone(),
                            source: e,
                        }
                    });
                }
                Err(e) if e.class() == ErrorClass::Permanent => {
                    warn!(folder = %absolute, error = %e, "Skipping unreadable folder");
                    skipped_folders.push(relative);
                    continue;
                }
                Err(e) => {
                    return Err(MigrationError::SourceInaccessible {
                        root: absolute,
                        source: e,
                    });
                }
            };
            folders_listed += 1;

            children.sort_by(|a, b| a.name.cmp(&b.name));

            let mut subfolders = Vec::new();
            for child in children {
                let child_path = relative.join(&child.name);

                if let Some(prefix) = self.exclusions.matching_prefix(&child_path) {
                    debug!(path = %child_path, prefix = %prefix, "Excluded");
                    continue;
                }

                if child.is_folder {
                    subfolders.push(child_path);
                } else {
                    descriptors.push(FileDescriptor {
                        relative_path: child_path,
                        size: child.size,
                        source_hash: child.hash,
                        modified_time: child.modified_time,
                    });
                }
            }

            stack.extend(subfolders.into_iter().rev());

            if throttle.should_log() {
                debug!(
                    folders = folders_listed,
                    files = descriptors.len(),
                    "Enumeration in progress"
                );
            }
        }

        info!(
            folders = folders_listed,
            files = descriptors.len(),
            skipped = skipped_folders.len(),
            "Enumeration complete"
        );

        Ok(Enumeration {
            files: descriptors,
            skipped_folders,
        })
    }

    async fn list(&self, folder: &RemotePath) -> Result<Vec<ChildEntry>, StorageError> {
        let client = self.client;
        call_with_retry(
            &self.policy,
            self.budget,
            self.timeout,
            "list_children",
            folder,
            move || client.list_children(folder),
        )
        .await
    }
}
