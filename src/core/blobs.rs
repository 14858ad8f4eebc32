use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use super::error::{CacheError, Result};

/// Extension given to committed blob files
const VALUE_EXT: &str = "val";

/// Filesystem-backed storage for values too large to keep inline.
///
/// Files are named from random UUIDs and partitioned two directory levels
/// deep (`ab/cd/rest.val`) to bound per-directory file counts. Writers
/// never collide because every write targets a fresh name; visibility is
/// established by the caller publishing the reference in the index.
#[derive(Debug, Clone)]
pub(crate) struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write `bytes` to a fresh file and return its relative reference.
    ///
    /// The content goes to a temporary sibling first and is renamed into
    /// place once fully written and synced, so no reader ever observes a
    /// partial file.
    pub(crate) fn store(&self, bytes: &[u8]) -> Result<String> {
        let hex = Uuid::new_v4().simple().to_string();
        let sub_dir = Path::new(&hex[..2]).join(&hex[2..4]);
        let directory = self.root.join(&sub_dir);
        fs::create_dir_all(&directory)?;

        let filename = sub_dir.join(format!("{}.{VALUE_EXT}", &hex[4..]));
        let full_path = self.root.join(&filename);
        let tmp_path = self.root.join(sub_dir.join(format!("{}.tmp", &hex[4..])));

        let mut writer = File::create(&tmp_path)?;
        writer.write_all(bytes)?;
        writer.sync_all()?;
        fs::rename(&tmp_path, &full_path)?;

        debug!(file = %filename.display(), size = bytes.len(), "stored blob");
        Ok(filename.to_string_lossy().into_owned())
    }

    /// Read a reference back to its bytes.
    ///
    /// A missing file maps to `NotFound`: the reference may have been
    /// removed by a racing delete, which callers treat as a cache miss.
    pub(crate) fn load(&self, filename: &str) -> Result<Vec<u8>> {
        match fs::read(self.root.join(filename)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(CacheError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a reference's file. Already-missing files are tolerated
    /// because two handles may race to delete the same entry.
    pub(crate) fn remove(&self, filename: &str) -> Result<()> {
        match fs::remove_file(self.root.join(filename)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Absolute path of a reference, for zero-copy consumers
    pub(crate) fn path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Remove a list of files, keeping going past individual failures
    pub(crate) fn remove_all(&self, filenames: &[String]) {
        for filename in filenames {
            if let Err(err) = self.remove(filename) {
                tracing::warn!(file = %filename, error = %err, "failed to remove blob file");
            }
        }
    }
}
