//! Local scratch space holding a file's bytes between download and upload.

use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const STAGING_PREFIX: &str = "cloudmig-";

#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Use `dir` for staged files, or the system temp directory.
    pub fn new(dir: Option<PathBuf>) -> io::Result<Self> {
        let dir = match dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                dir
            }
            None => std::env::temp_dir(),
        };
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create an empty staged file. It is deleted when the returned value is
    /// dropped, whichever way the transfer ends.
    pub fn stage(&self) -> io::Result<StagedFile> {
        let file = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&self.dir)?;
        Ok(StagedFile { file })
    }
}

pub struct StagedFile {
    file: NamedTempFile,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Handle for writing the downloaded bytes.
    pub fn writer(&self) -> io::Result<tokio::fs::File> {
        Ok(tokio::fs::File::from_std(self.file.as_file().try_clone()?))
    }

    /// Fresh handle positioned at the start, for the upload.
    pub fn reader(&self) -> io::Result<tokio::fs::File> {
        Ok(tokio::fs::File::from_std(self.file.reopen()?))
    }
}
