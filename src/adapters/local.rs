use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::core::models::RemotePath;
use crate::core::storage::{ChildEntry, ObjectMetadata, StorageClient};
use crate::error::StorageError;

/// Buffer size for hashing (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// Suffix of in-flight uploads; such files are invisible to listings.
const PARTIAL_SUFFIX: &str = ".cloudmig-partial";

/// A storage account backed by a local directory, such as a provider's sync
/// folder or a mounted drive.
///
/// Hashes are BLAKE3 and computed on demand in `metadata`; listings leave them
/// out so that enumerating a large tree does not read every byte twice.
pub struct LocalStorage {
    base: PathBuf,
}

impl LocalStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, path: &RemotePath) -> PathBuf {
        let mut resolved = self.base.clone();
        for segment in path.segments() {
            resolved.push(segment);
        }
        resolved
    }
}

#[async_trait]
impl StorageClient for LocalStorage {
    async fn list_children(&self, folder: &RemotePath) -> Result<Vec<ChildEntry>, StorageError> {
        let dir = self.resolve(folder);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| map_io_error(&dir, &e))?;

        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| map_io_error(&dir, &e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }

            // symlink_metadata so links are never followed out of the account
            let metadata = match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if metadata.is_dir() {
                children.push(ChildEntry {
                    name,
                    is_folder: true,
                    size: 0,
                    hash: None,
                    modified_time: modified_of(&metadata),
                });
            } else if metadata.is_file() {
                children.push(ChildEntry {
                    name,
                    is_folder: false,
                    size: metadata.len(),
                    hash: None,
                    modified_time: modified_of(&metadata),
                });
            }
            // Skip symlinks and other special files
        }

        Ok(children)
    }

    async fn download(
        &self,
        path: &RemotePath,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, StorageError> {
        let file_path = self.resolve(path);
        let mut file = tokio::fs::File::open(&file_path)
            .await
            .map_err(|e| map_io_error(&file_path, &e))?;

        let copied = tokio::io::copy(&mut file, sink)
            .await
            .map_err(|e| map_io_error(&file_path, &e))?;
        sink.flush().await.map_err(|e| map_io_error(&file_path, &e))?;

        Ok(copied)
    }

    async fn upload(
        &self,
        path: &RemotePath,
        source: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
        modified_time: DateTime<Utc>,
    ) -> Result<ObjectMetadata, StorageError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io_error(parent, &e))?;
        }

        let partial = partial_sibling(&target);
        let written = write_partial(&partial, source).await;
        let written = match written {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(map_io_error(&target, &e));
            }
        };

        if written != size {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(StorageError::Transient(format!(
                "short upload to {}: expected {} bytes, wrote {}",
                path, size, written
            )));
        }

        let mtime = filetime::FileTime::from_unix_time(
            modified_time.timestamp(),
            modified_time.timestamp_subsec_nanos(),
        );
        if let Err(e) = filetime::set_file_mtime(&partial, mtime) {
            debug!(path = %partial.display(), error = %e, "Failed to preserve modification time");
        }

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| map_io_error(&target, &e))?;

        self.metadata(path).await
    }

    async fn metadata(&self, path: &RemotePath) -> Result<ObjectMetadata, StorageError> {
        let file_path = self.resolve(path);
        let metadata = tokio::fs::symlink_metadata(&file_path)
            .await
            .map_err(|e| map_io_error(&file_path, &e))?;

        if metadata.is_dir() {
            return Ok(ObjectMetadata {
                size: 0,
                hash: None,
                modified_time: modified_of(&metadata),
            });
        }

        let hash_path = file_path.clone();
        let hash = tokio::task::spawn_blocking(move || hash_file_sync(&hash_path))
            .await
            .map_err(|e| StorageError::Transient(format!("hash task failed: {}", e)))?
            .map_err(|e| map_io_error(&file_path, &e))?;

        Ok(ObjectMetadata {
            size: metadata.len(),
            hash: Some(hash.to_hex().to_string()),
            modified_time: modified_of(&metadata),
        })
    }
}

async fn write_partial(partial: &Path, source: &mut (dyn AsyncRead + Unpin + Send)) -> io::Result<u64> {
    let mut file = tokio::fs::File::create(partial).await?;
    let written = tokio::io::copy(source, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

fn partial_sibling(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

fn modified_of(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Hash a file using BLAKE3, streaming in chunks to handle large files.
fn hash_file_sync(path: &Path) -> io::Result<blake3::Hash> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Translate a filesystem error into the storage taxonomy.
fn map_io_error(path: &Path, error: &io::Error) -> StorageError {
    let shown = format!("{}: {}", path.display(), error);
    match error.kind() {
        ErrorKind::NotFound => StorageError::NotFound(shown),
        ErrorKind::PermissionDenied => StorageError::PermissionDenied(shown),
        ErrorKind::TimedOut => StorageError::Timeout(std::time::Duration::ZERO),
        ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => StorageError::Transient(shown),
        _ => match error.raw_os_error() {
            // out of space or quota: nothing further will fit
            Some(code) if code == libc::ENOSPC || code == libc::EDQUOT || code == libc::EROFS => {
                StorageError::Fatal(shown)
            }
            Some(code) if code == libc::ENOTDIR || code == libc::EISDIR => {
                StorageError::PermissionDenied(shown)
            }
            _ => StorageError::Transient(shown),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_list_skips_partials() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("A/sub")).unwrap();
        std::fs::write(temp.path().join("A/doc.txt"), b"0123456789").unwrap();
        std::fs::write(temp.path().join("A/doc.txt.cloudmig-partial"), b"01").unwrap();

        let storage = LocalStorage::new(temp.path());
        let mut children = storage.list_children(&RemotePath::parse("A")).await.unwrap();
        children.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name, "doc.txt");
        assert_eq!(children[0].size, 10);
        assert!(!children[0].is_folder);
        assert!(children[1].is_folder);
    }

    #[tokio::test]
    async fn test_missing_folder_is_not_found() {
        let temp = tempdir().unwrap();
        let storage = LocalStorage::new(temp.path());
        let err = storage
            .list_children(&RemotePath::parse("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_upload_creates_parents_and_preserves_mtime() {
        let temp = tempdir().unwrap();
        let storage = LocalStorage::new(temp.path());
        let when = DateTime::parse_from_rfc3339("2021-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut reader: &[u8] = b"payload";
        let meta = storage
            .upload(&RemotePath::parse("Migrated/a/b.txt"), &mut reader, 7, when)
            .await
            .unwrap();

        let on_disk = temp.path().join("Migrated/a/b.txt");
        assert_eq!(std::fs::read(&on_disk).unwrap(), b"payload");
        assert!(!temp.path().join("Migrated/a/b.txt.cloudmig-partial").exists());
        assert_eq!(meta.size, 7);
        assert_eq!(meta.hash, Some(blake3::hash(b"payload").to_hex().to_string()));
        assert_eq!(meta.modified_time.timestamp(), when.timestamp());
    }

    #[tokio::test]
    async fn test_short_upload_rejected_and_cleaned_up() {
        let temp = tempdir().unwrap();
        let storage = LocalStorage::new(temp.path());

        let mut reader: &[u8] = b"abc";
        let err = storage
            .upload(&RemotePath::parse("x.txt"), &mut reader, 10, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Transient(_)));
        assert!(!temp.path().join("x.txt").exists());
        assert!(!temp.path().join("x.txt.cloudmig-partial").exists());
    }

    #[tokio::test]
    async fn test_download_streams_bytes() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("f.bin"), vec![0xAB; 10 * 1024]).unwrap();
        let storage = LocalStorage::new(temp.path());

        let mut sink = Vec::new();
        let n = storage
            .download(&RemotePath::parse("f.bin"), &mut sink)
            .await
            .unwrap();
        assert_eq!(n, 10 * 1024);
        assert!(sink.iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn test_io_error_mapping() {
        let p = Path::new("/x");
        assert!(matches!(
            map_io_error(p, &io::Error::new(ErrorKind::NotFound, "nf")),
            StorageError::NotFound(_)
        ));
        assert!(matches!(
            map_io_error(p, &io::Error::new(ErrorKind::PermissionDenied, "pd")),
            StorageError::PermissionDenied(_)
        ));
        assert!(matches!(
            map_io_error(p, &io::Error::from_raw_os_error(libc::ENOSPC)),
            StorageError::Fatal(_)
        ));
        assert!(matches!(
            map_io_error(p, &io::Error::from_raw_os_error(libc::EIO)),
            StorageError::Transient(_)
        ));
    }
}
