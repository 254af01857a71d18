//! Cross-process repository locks.
//!
//! Every lock is an `fs2` advisory lock on a file under `<cache root>/.locks`,
//! named after the repository's root directory. Lock files live outside the
//! root so that removing a repository never pulls the lock out from under a
//! waiter. Callers take scopes in the order mutation, repository, workspace.

use repolens_core::identity::{sanitize_segment, short_hash};
use repolens_core::{CacheError, CacheResult, RepoIdentity, WorkspaceKey};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Directory (relative to the cache root) holding lock files.
pub const LOCKS_DIR: &str = ".locks";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Access mode used when acquiring a lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Many holders; excludes `Exclusive`.
    Shared,
    /// Single holder.
    Exclusive,
}

/// What a lock protects.
#[derive(Clone, Copy, Debug)]
pub enum LockScope<'a> {
    /// Serializes clone and refresh of one repository.
    Mutation,
    /// The repository root as a whole. Readers share it, clone and eviction
    /// take it exclusively.
    Repository,
    /// One workspace; checkout is exclusive, reads are shared.
    Workspace(&'a WorkspaceKey),
}

impl LockScope<'_> {
    fn suffix(&self) -> String {
        match self {
            Self::Mutation => "mutation".to_owned(),
            Self::Repository => "repo".to_owned(),
            Self::Workspace(key) => {
                let label = key.to_string();
                format!("ws-{}-{}", sanitize_segment(&label), short_hash(&label))
            }
        }
    }
}

/// Guard representing a held lock. The lock is released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    const fn new(file: File, path: PathBuf, mode: LockMode) -> Self {
        Self { file, path, mode }
    }

    /// Mode the lock is held in.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    fn unlock(&self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), mode = ?self.mode, error = %err, "failed to release lock");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Hands out scoped locks for cached repositories.
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    dir: PathBuf,
    timeout: Duration,
}

impl LockCoordinator {
    /// Coordinator storing lock files under `cache_root`.
    ///
    /// # Errors
    /// Returns an I/O error when the lock directory cannot be created.
    pub fn new(cache_root: &Path, timeout: Duration) -> io::Result<Self> {
        let dir = cache_root.join(LOCKS_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, timeout })
    }

    /// Default wait used by [`Self::acquire`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire a lock, waiting up to the configured timeout.
    ///
    /// # Errors
    /// Returns [`CacheError::LockTimeout`] when the lock stays contended, or an
    /// I/O error when the lock file cannot be opened.
    pub async fn acquire(
        &self,
        identity: &RepoIdentity,
        root: &Path,
        scope: LockScope<'_>,
        mode: LockMode,
    ) -> CacheResult<LockGuard> {
        self.acquire_within(identity, root, scope, mode, self.timeout).await
    }

    /// Acquire a lock, waiting up to `timeout`.
    ///
    /// # Errors
    /// See [`Self::acquire`].
    pub async fn acquire_within(
        &self,
        identity: &RepoIdentity,
        root: &Path,
        scope: LockScope<'_>,
        mode: LockMode,
        timeout: Duration,
    ) -> CacheResult<LockGuard> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire(root, scope, mode)? {
                return Ok(guard);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                debug!(%identity, scope = ?scope, mode = ?mode, "lock acquisition timed out");
                return Err(CacheError::LockTimeout {
                    identity: identity.clone(),
                    waited,
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout - waited)).await;
        }
    }

    /// Attempt to acquire the lock without waiting.
    ///
    /// # Errors
    /// Returns an I/O error for failures other than contention.
    pub fn try_acquire(
        &self,
        root: &Path,
        scope: LockScope<'_>,
        mode: LockMode,
    ) -> CacheResult<Option<LockGuard>> {
        let (file, path) = self.open_lock_file(root, scope)?;
        let result = match mode {
            LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
            LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
        };
        match result {
            Ok(()) => Ok(Some(LockGuard::new(file, path, mode))),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Path of the lock file for `root` and `scope`.
    #[must_use]
    pub fn lock_path(&self, root: &Path, scope: LockScope<'_>) -> PathBuf {
        let name = root
            .file_name()
            .map_or_else(|| "root".to_owned(), |name| name.to_string_lossy().into_owned());
        self.dir.join(format!("{name}.{}.lock", scope.suffix()))
    }

    fn open_lock_file(&self, root: &Path, scope: LockScope<'_>) -> io::Result<(File, PathBuf)> {
        let path = self.lock_path(root, scope);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok((file, path))
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
