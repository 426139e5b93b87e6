//! Project-wide locking
//!
//! A cleanup run holds `project.<name>` for its whole duration so builds and
//! other cleanups of the same project never interleave with deletion. The
//! lock is released exactly once: explicitly, or when the handle drops.

use crate::error::{KeelError, KeelResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Interval between attempts while waiting for a held lock
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lock key for a project
pub fn project_lock_key(project: &str) -> String {
    format!("project.{}", project)
}

/// Grants exclusive named locks
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire `key`, waiting up to the manager's configured timeout
    async fn acquire(&self, key: &str) -> KeelResult<LockHandle>;
}

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// A held lock
pub struct LockHandle {
    key: String,
    released: Arc<AtomicBool>,
    release_hook: Option<ReleaseHook>,
}

impl LockHandle {
    pub fn new(key: impl Into<String>, release_hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            key: key.into(),
            released: Arc::new(AtomicBool::new(false)),
            release_hook: Some(Box::new(release_hook)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Observer that reports whether this lock has been released
    pub fn watch(&self) -> LockWatch {
        LockWatch {
            released: Arc::clone(&self.released),
        }
    }

    /// Release the lock now
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(hook) = self.release_hook.take() {
            hook();
            self.released.store(true, Ordering::SeqCst);
            debug!("Released lock {}", self.key);
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Read-only view of a lock's state, usable after the handle is gone
#[derive(Debug, Clone)]
pub struct LockWatch {
    released: Arc<AtomicBool>,
}

impl LockWatch {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Cross-process locks using `flock` on files under the state directory
pub struct FileLockManager {
    dir: PathBuf,
    wait: Duration,
}

impl FileLockManager {
    /// `wait` of zero fails immediately when the lock is held
    pub fn new(dir: impl Into<PathBuf>, wait: Duration) -> Self {
        Self {
            dir: dir.into(),
            wait,
        }
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", key))
    }

    fn open(&self, key: &str) -> KeelResult<File> {
        std::fs::create_dir_all(&self.dir).map_err(|e| KeelError::ConfigDirCreate {
            path: self.dir.clone(),
            source: e,
        })?;
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path(key))
            .map_err(|e| KeelError::LockFailed {
                key: key.to_string(),
                source: e,
            })
    }
}

#[async_trait]
impl LockManager for FileLockManager {
    async fn acquire(&self, key: &str) -> KeelResult<LockHandle> {
        let file = self.open(key)?;
        let started = Instant::now();
        let mut announced = false;

        loop {
            let acquired = try_flock_exclusive(&file).map_err(|e| KeelError::LockFailed {
                key: key.to_string(),
                source: e,
            })?;
            if acquired {
                debug!("Acquired lock {}", key);
                return Ok(LockHandle::new(key, move || unlock(file)));
            }

            if started.elapsed() >= self.wait {
                return Err(KeelError::LockUnavailable {
                    key: key.to_string(),
                });
            }
            if !announced {
                info!("Waiting for lock {} (up to {:?})", key, self.wait);
                announced = true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

fn unlock(file: File) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: as above; closing the file would release the lock anyway.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
    drop(file);
}

/// In-process locks, for tests and single-process embedding
#[derive(Debug, Default, Clone)]
pub struct MemoryLockManager {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, key: &str) -> KeelResult<LockHandle> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| KeelError::Internal("lock table poisoned".to_string()))?;
        if !held.insert(key.to_string()) {
            return Err(KeelError::LockUnavailable {
                key: key.to_string(),
            });
        }

        let table = Arc::clone(&self.held);
        let owned = key.to_string();
        Ok(LockHandle::new(key, move || {
            if let Ok(mut held) = table.lock() {
                held.remove(&owned);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn project_key_format() {
        assert_eq!(project_lock_key("shop"), "project.shop");
    }

    #[tokio::test]
    async fn memory_lock_is_exclusive() {
        let manager = MemoryLockManager::new();
        let handle = manager.acquire("project.shop").await.unwrap();

        let err = manager.acquire("project.shop").await.unwrap_err();
        assert!(matches!(err, KeelError::LockUnavailable { .. }));

        handle.release();
        assert!(!manager.is_held("project.shop"));
        assert!(manager.acquire("project.shop").await.is_ok());
    }

    #[tokio::test]
    async fn drop_releases_and_watch_observes() {
        let manager = MemoryLockManager::new();
        let handle = manager.acquire("project.shop").await.unwrap();
        let watch = handle.watch();
        assert!(!watch.is_released());

        drop(handle);
        assert!(watch.is_released());
        assert!(!manager.is_held("project.shop"));
    }

    #[tokio::test]
    async fn file_lock_fails_fast_when_held() {
        let temp = TempDir::new().unwrap();
        let first = FileLockManager::new(temp.path(), Duration::ZERO);
        let second = FileLockManager::new(temp.path(), Duration::ZERO);

        let handle = first.acquire("project.shop").await.unwrap();
        assert!(temp.path().join("project.shop.lock").exists());

        let err = second.acquire("project.shop").await.unwrap_err();
        assert!(matches!(err, KeelError::LockUnavailable { .. }));

        handle.release();
        assert!(second.acquire("project.shop").await.is_ok());
    }

    #[tokio::test]
    async fn file_lock_waits_for_release() {
        let temp = TempDir::new().unwrap();
        let holder = FileLockManager::new(temp.path(), Duration::ZERO);
        let waiter = FileLockManager::new(temp.path(), Duration::from_secs(5));

        let handle = holder.acquire("project.shop").await.unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(handle);
        });

        let acquired = waiter.acquire("project.shop").await.unwrap();
        assert_eq!(acquired.key(), "project.shop");
        release.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_conflict() {
        let temp = TempDir::new().unwrap();
        let manager = FileLockManager::new(temp.path(), Duration::ZERO);
        let _a = manager.acquire("project.a").await.unwrap();
        assert!(manager.acquire("project.b").await.is_ok());
    }
}
