//! Per-repository locking
//!
//! A repository is locked while its metadata is being pushed so two
//! concurrent pushers cannot corrupt the remote repository document.
//! The lock is an empty file at a deterministic path derived from a
//! checksum of the repository identifier, which keeps arbitrary
//! repository names safe as file names.
//!
//! Acquisition is a single atomic create-new, so there is no window
//! between checking and creating. The lock stays advisory: a process
//! that bypasses the registry API is not stopped by it. A crashed
//! holder leaves a stale file behind; any caller that observes the
//! lock's age past the configured lifespan may force-release it.

use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::warn;

/// Default lifespan after which a lock may be forcibly released
pub const DEFAULT_LOCK_LIFESPAN: Duration = Duration::from_secs(30);

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("repository '{repository}' is locked by another process (lock age {age:?})")]
    AlreadyLocked {
        repository: String,
        age: Duration,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Manages lock files under `<registry>/locks`.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    /// Create a manager over the given lock directory.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Acquire the lock for a repository. Fails immediately with
    /// [`LockError::AlreadyLocked`] when another holder exists; callers
    /// wanting to steal a stale lock run [`try_release`](Self::try_release)
    /// first.
    pub fn acquire(&self, repository: &str) -> Result<LockGuard<'_>, LockError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(repository);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(LockGuard {
                manager: self,
                repository: repository.to_string(),
                released: false,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(LockError::AlreadyLocked {
                    repository: repository.to_string(),
                    age: self.age(repository)?.unwrap_or(Duration::ZERO),
                })
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Release the lock for a repository. Releasing a lock that does
    /// not exist is not an error.
    pub fn release(&self, repository: &str) -> Result<(), LockError> {
        let path = self.lock_path(repository);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Force-release the lock when it has outlived `lifespan`. Returns
    /// true when a stale lock was removed, false when there is no lock
    /// or the lock is still fresh. Never blocks waiting for staleness.
    pub fn try_release(&self, repository: &str, lifespan: Duration) -> Result<bool, LockError> {
        match self.age(repository)? {
            None => Ok(false),
            Some(age) if age >= lifespan => {
                warn!(repository, ?age, "force releasing stale lock");
                self.release(repository)?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Whether the repository is currently locked.
    pub fn is_locked(&self, repository: &str) -> bool {
        self.lock_path(repository).exists()
    }

    /// Age of the current lock, `None` when unlocked.
    pub fn age(&self, repository: &str) -> Result<Option<Duration>, LockError> {
        let path = self.lock_path(repository);
        match fs::metadata(&path) {
            Ok(meta) => {
                let modified = meta.modified()?;
                Ok(Some(
                    SystemTime::now()
                        .duration_since(modified)
                        .unwrap_or(Duration::ZERO),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Deterministic, checksum-derived lock file path.
    fn lock_path(&self, repository: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(repository.as_bytes());
        let checksum = hex::encode(hasher.finalize());
        self.dir.join(format!("{}.lock", checksum))
    }

    /// The directory lock files live in.
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

/// Scoped lock: releasing happens on drop, so error paths cannot leak a
/// held lock.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    repository: String,
    released: bool,
}

impl LockGuard<'_> {
    /// Release explicitly, surfacing any error the drop path would
    /// swallow.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.manager.release(&self.repository)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.manager.release(&self.repository) {
                warn!(repository = %self.repository, error = %e, "failed to release lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path().join("locks"));

        let guard = locks.acquire("tools/builder").unwrap();
        assert!(locks.is_locked("tools/builder"));
        guard.release().unwrap();
        assert!(!locks.is_locked("tools/builder"));
    }

    #[test]
    fn test_second_acquire_reports_locked() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path().join("locks"));

        let _guard = locks.acquire("tools/builder").unwrap();
        let err = locks.acquire("tools/builder").unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked { .. }));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path().join("locks"));
        {
            let _guard = locks.acquire("tools/builder").unwrap();
            assert!(locks.is_locked("tools/builder"));
        }
        assert!(!locks.is_locked("tools/builder"));
        // reacquire works immediately
        let _guard = locks.acquire("tools/builder").unwrap();
    }

    #[test]
    fn test_try_release_fresh_lock_kept() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path().join("locks"));
        let _guard = locks.acquire("tools/builder").unwrap();

        let released = locks
            .try_release("tools/builder", Duration::from_secs(60))
            .unwrap();
        assert!(!released);
        assert!(locks.is_locked("tools/builder"));
    }

    #[test]
    fn test_try_release_stale_lock_removed() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path().join("locks"));
        let guard = locks.acquire("tools/builder").unwrap();
        // forget the guard so the file survives, simulating a crashed
        // holder
        std::mem::forget(guard);

        let released = locks
            .try_release("tools/builder", Duration::ZERO)
            .unwrap();
        assert!(released);
        assert!(!locks.is_locked("tools/builder"));
    }

    #[test]
    fn test_try_release_no_lock() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path().join("locks"));
        assert!(!locks.try_release("tools/builder", Duration::ZERO).unwrap());
    }

    #[test]
    fn test_lock_names_are_checksummed() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path().join("locks"));
        let _guard = locks.acquire("weird/../name with spaces").unwrap();
        for entry in fs::read_dir(locks.path()).unwrap() {
            let name = entry.unwrap().file_name();
            let name = name.to_string_lossy().to_string();
            assert!(name.ends_with(".lock"));
            assert_eq!(name.len(), 64 + ".lock".len());
        }
    }

    #[test]
    fn test_release_without_lock_is_ok() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path().join("locks"));
        locks.release("tools/builder").unwrap();
    }
}
