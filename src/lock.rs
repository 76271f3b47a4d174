use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// An advisory lock on a store's file, implemented as a sibling
/// `<filename>.lock~` marker created atomically so two processes racing to
/// open the same store can never both succeed.
///
/// On unix this is a `symlink` (symlink creation is atomic and fails with
/// `AlreadyExists` if the target exists). Elsewhere it falls back to
/// `OpenOptions::create_new`, which gives the same atomicity guarantee
/// without needing a symlink target.
///
/// Best-effort release on `Drop`; a process that is killed (not merely
/// exits normally) leaves the lock file behind, exactly like the store it
/// is modeled after — recovery of a stale lock is left to the operator.
pub struct LockFile {
    path: PathBuf,
    released: bool,
}

impl LockFile {
    pub fn acquire(store_path: &Path) -> Result<Self> {
        let path = lock_path(store_path);
        Self::create(&path).map_err(|_| Error::DatabaseLocked {
            filename: store_path.display().to_string(),
        })?;
        Ok(Self {
            path,
            released: false,
        })
    }

    #[cfg(unix)]
    fn create(path: &Path) -> std::io::Result<()> {
        std::os::unix::fs::symlink(std::process::id().to_string(), path)
    }

    #[cfg(not(unix))]
    fn create(path: &Path) -> std::io::Result<()> {
        use std::fs::OpenOptions;
        OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(())
    }

    /// Release the lock early. Also happens automatically on `Drop`.
    pub fn release(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_path(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock~");
    match store_path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
