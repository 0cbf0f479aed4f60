use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::models::RemotePath;
use crate::core::storage::{ChildEntry, ObjectMetadata, StorageClient};
use crate::error::StorageError;

/// Storage operations that faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedOp {
    List,
    Download,
    Upload,
    Metadata,
}

#[derive(Debug, Clone)]
enum Node {
    Folder,
    File {
        data: Vec<u8>,
        modified_time: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct Fault {
    op: SimulatedOp,
    path: RemotePath,
    error: StorageError,
    /// None fails forever
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<RemotePath, Node>,
    faults: Vec<Fault>,
    list_calls: Vec<RemotePath>,
    calls: HashMap<(SimulatedOp, RemotePath), usize>,
    bytes_uploaded: u64,
}

/// In-memory storage account with call accounting and fault injection.
///
/// Stands in for a remote provider in tests and dry runs. Every call is
/// counted per operation and path, and any operation on a path can be made to
/// fail a given number of times (or forever) with a chosen `StorageError`.
pub struct SimulatedStorage {
    state: Mutex<State>,
    hashes: bool,
}

impl Default for SimulatedStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedStorage {
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert(RemotePath::root(), Node::Folder);
        Self {
            state: Mutex::new(state),
            hashes: true,
        }
    }

    /// An account whose provider reports no content hashes.
    pub fn without_hashes() -> Self {
        Self {
            hashes: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("simulated storage lock poisoned")
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.put_file_at(path, data, Utc::now());
    }

    pub fn put_file_at(&self, path: &str, data: &[u8], modified_time: DateTime<Utc>) {
        let path = RemotePath::parse(path);
        let mut state = self.lock();
        insert_ancestors(&mut state.nodes, &path);
        state.nodes.insert(
            path,
            Node::File {
                data: data.to_vec(),
                modified_time,
            },
        );
    }

    pub fn put_folder(&self, path: &str) {
        let path = RemotePath::parse(path);
        let mut state = self.lock();
        insert_ancestors(&mut state.nodes, &path);
        state.nodes.insert(path, Node::Folder);
    }

    pub fn remove(&self, path: &str) {
        let path = RemotePath::parse(path);
        self.lock().nodes.retain(|p, _| !p.starts_with(&path));
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(&RemotePath::parse(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Paths of every file in the account, in order.
    pub fn file_paths(&self) -> Vec<String> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, node)| matches!(node, Node::File { .. }))
            .map(|(path, _)| path.to_string())
            .collect()
    }

    /// Make `times` calls of `op` on `path` fail with `error`; `None` fails forever.
    pub fn inject(&self, op: SimulatedOp, path: &str, error: StorageError, times: Option<usize>) {
        self.lock().faults.push(Fault {
            op,
            path: RemotePath::parse(path),
            error,
            remaining: times,
        });
    }

    pub fn fail_list(&self, path: &str, error: StorageError, times: usize) {
        self.inject(SimulatedOp::List, path, error, Some(times));
    }

    pub fn fail_download(&self, path: &str, error: StorageError, times: usize) {
        self.inject(SimulatedOp::Download, path, error, Some(times));
    }

    pub fn fail_upload(&self, path: &str, error: StorageError, times: usize) {
        self.inject(SimulatedOp::Upload, path, error, Some(times));
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Number of `op` calls made against exactly `path`.
    pub fn calls(&self, op: SimulatedOp, path: &str) -> usize {
        self.lock()
            .calls
            .get(&(op, RemotePath::parse(path)))
            .copied()
            .unwrap_or(0)
    }

    /// Total number of `op` calls against any path.
    pub fn total_calls(&self, op: SimulatedOp) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|((o, _), _)| *o == op)
            .map(|(_, n)| n)
            .sum()
    }

    /// List calls made on `prefix` or any folder below it.
    pub fn list_calls_under(&self, prefix: &RemotePath) -> usize {
        self.lock()
            .list_calls
            .iter()
            .filter(|p| p.starts_with(prefix))
            .count()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.lock().bytes_uploaded
    }

    fn hash(&self, data: &[u8]) -> Option<String> {
        self.hashes.then(|| blake3::hash(data).to_hex().to_string())
    }

    /// Count the call and return the injected error, if one is due.
    fn begin(&self, op: SimulatedOp, path: &RemotePath) -> Result<(), StorageError> {
        let mut state = self.lock();
        *state.calls.entry((op, path.clone())).or_insert(0) += 1;
        if op == SimulatedOp::List {
            state.list_calls.push(path.clone());
        }

        let fault = state
            .faults
            .iter_mut()
            .find(|f| f.op == op && &f.path == path && f.remaining != Some(0));
        match fault {
            Some(fault) => {
                if let Some(n) = fault.remaining.as_mut() {
                    *n -= 1;
                }
                Err(fault.error.clone())
            }
            None => Ok(()),
        }
    }
}

fn insert_ancestors(nodes: &mut BTreeMap<RemotePath, Node>, path: &RemotePath) {
    let mut current = path.parent();
    while let Some(folder) = current {
        nodes.entry(folder.clone()).or_insert(Node::Folder);
        current = folder.parent();
    }
}

#[async_trait]
impl StorageClient for SimulatedStorage {
    async fn list_children(&self, folder: &RemotePath) -> Result<Vec<ChildEntry>, StorageError> {
        self.begin(SimulatedOp::List, folder)?;

        let state = self.lock();
        match state.nodes.get(folder) {
            Some(Node::Folder) => {}
            _ => return Err(StorageError::NotFound(folder.to_string())),
        }

        let children = state
            .nodes
            .iter()
            .filter(|(path, _)| path.parent().as_ref() == Some(folder))
            .map(|(path, node)| {
                let name = path.name().unwrap_or_default().to_string();
                match node {
                    Node::Folder => ChildEntry {
                        name,
                        is_folder: true,
                        size: 0,
                        hash: None,
                        modified_time: Utc::now(),
                    },
                    Node::File {
                        data,
                        modified_time,
                    } => ChildEntry {
                        name,
                        is_folder: false,
                        size: data.len() as u64,
                        hash: self.hash(data),
                        modified_time: *modified_time,
                    },
                }
            })
            .collect();

        Ok(children)
    }

    async fn download(
        &self,
        path: &RemotePath,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, StorageError> {
        self.begin(SimulatedOp::Download, path)?;

        let data = match self.lock().nodes.get(path) {
            Some(Node::File { data, .. }) => data.clone(),
            _ => return Err(StorageError::NotFound(path.to_string())),
        };

        sink.write_all(&data)
            .await
            .map_err(|e| StorageError::Transient(format!("staging write failed: {}", e)))?;
        sink.flush()
            .await
            .map_err(|e| StorageError::Transient(format!("staging flush failed: {}", e)))?;

        Ok(data.len() as u64)
    }

    async fn upload(
        &self,
        path: &RemotePath,
        source: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
        modified_time: DateTime<Utc>,
    ) -> Result<ObjectMetadata, StorageError> {
        self.begin(SimulatedOp::Upload, path)?;

        let mut data = Vec::with_capacity(size as usize);
        source
            .read_to_end(&mut data)
            .await
            .map_err(|e| StorageError::Transient(format!("reading staged bytes failed: {}", e)))?;

        if data.len() as u64 != size {
            return Err(StorageError::Transient(format!(
                "short upload: expected {} bytes, got {}",
                size,
                data.len()
            )));
        }

        let metadata = ObjectMetadata {
            size,
            hash: self.hash(&data),
            modified_time,
        };

        let mut state = self.lock();
        if let Some(Node::Folder) = state.nodes.get(path) {
            return Err(StorageError::PermissionDenied(format!(
                "{} is a folder",
                path
            )));
        }
        insert_ancestors(&mut state.nodes, path);
        state.bytes_uploaded += size;
        state.nodes.insert(
            path.clone(),
            Node::File {
                data,
                modified_time,
            },
        );

        Ok(metadata)
    }

    async fn metadata(&self, path: &RemotePath) -> Result<ObjectMetadata, StorageError> {
        self.begin(SimulatedOp::Metadata, path)?;

        match self.lock().nodes.get(path) {
            Some(Node::File {
                data,
                modified_time,
            }) => Ok(ObjectMetadata {
                size: data.len() as u64,
                hash: self.hash(data),
                modified_time: *modified_time,
            }),
            Some(Node::Folder) => Ok(ObjectMetadata {
                size: 0,
                hash: None,
                modified_time: Utc::now(),
            }),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_children_and_implicit_folders() {
        let storage = SimulatedStorage::new();
        storage.put_file("A/doc.txt", b"0123456789");
        storage.put_file("A/sub/x.bin", b"x");

        let mut names: Vec<_> = storage
            .list_children(&RemotePath::parse("A"))
            .await
            .unwrap()
            .into_iter()
            .map(|c| (c.name, c.is_folder))
            .collect();
        names.sort();

        assert_eq!(
            names,
            vec![("doc.txt".to_string(), false), ("sub".to_string(), true)]
        );
        assert_eq!(storage.calls(SimulatedOp::List, "A"), 1);
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let storage = SimulatedStorage::new();
        let mut reader: &[u8] = b"hello";
        let meta = storage
            .upload(&RemotePath::parse("x/y.txt"), &mut reader, 5, Utc::now())
            .await
            .unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.hash, Some(blake3::hash(b"hello").to_hex().to_string()));
        assert_eq!(storage.bytes_uploaded(), 5);

        let mut sink = Vec::new();
        let n = storage
            .download(&RemotePath::parse("x/y.txt"), &mut sink)
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(sink, b"hello");
    }

    #[tokio::test]
    async fn test_injected_fault_counts_down() {
        let storage = SimulatedStorage::new();
        storage.put_file("f.txt", b"f");
        storage.inject(
            SimulatedOp::Metadata,
            "f.txt",
            StorageError::Transient("502".into()),
            Some(1),
        );

        let path = RemotePath::parse("f.txt");
        assert!(storage.metadata(&path).await.is_err());
        assert!(storage.metadata(&path).await.is_ok());
        assert_eq!(storage.calls(SimulatedOp::Metadata, "f.txt"), 2);
    }

    #[tokio::test]
    async fn test_without_hashes_reports_none() {
        let storage = SimulatedStorage::without_hashes();
        storage.put_file("f.txt", b"f");
        let meta = storage.metadata(&RemotePath::parse("f.txt")).await.unwrap();
        assert!(meta.hash.is_none());
        assert_eq!(meta.size, 1);
    }
}
