//! Process-wide advisory file lock at `<repo_root>/.git/binsync.lock`
//! (§4.4.1 step 5, §6). Acquired exclusively at attach time with zero
//! timeout: a second `Client` on the same repository fails immediately
//! rather than waiting, per the lock-exclusion testable property (§8.6).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, Result};

/// RAII guard over the held lock file. `Drop` releases the OS-level
/// advisory lock via `unlock`; the lock file itself is left on disk so a
/// later `acquire` can reopen and re-lock the same path.
pub struct RepoLock {
    path: PathBuf,
    file: File,
}

impl RepoLock {
    /// Acquires the lock at `<repo_root>/.git/binsync.lock`, failing
    /// immediately (no blocking wait) if another process holds it.
    pub fn acquire(repo_root: &Path) -> Result<Self> {
        let path = repo_root.join(".git").join("binsync.lock");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| Error::LockContention {
            path: path.display().to_string(),
        })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_on_same_repo_fails() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();

        let first = RepoLock::acquire(dir.path()).unwrap();
        let second = RepoLock::acquire(dir.path());
        assert!(matches!(second, Err(Error::LockContention { .. })));
        drop(first);
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();

        {
            let _lock = RepoLock::acquire(dir.path()).unwrap();
        }
        let reacquired = RepoLock::acquire(dir.path());
        assert!(reacquired.is_ok());
    }
}
