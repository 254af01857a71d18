use crate::reconcile::OrphanPolicy;
use repolens_core::{BranchStrategy, CacheError, CacheResult};
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum number of cached repositories.
pub const DEFAULT_MAX_CACHED_REPOS: usize = 50;
/// Default number of background clone/refresh workers.
pub const DEFAULT_WORKERS: usize = 4;
/// Default wait for a repository lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for one clone or refresh.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(900);

/// Settings consumed by [`crate::RepositoryCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding every cached repository and the manifest.
    pub root: PathBuf,
    /// Capacity in repositories.
    pub max_cached_repos: usize,
    /// Strategy used when a request does not name one.
    pub default_strategy: BranchStrategy,
    /// Concurrent background operations.
    pub workers: usize,
    /// How long lock acquisition may wait.
    pub lock_timeout: Duration,
    /// Deadline for a whole clone or refresh.
    pub operation_timeout: Duration,
    /// What startup reconciliation does with unknown directories.
    pub orphan_policy: OrphanPolicy,
}

impl CacheConfig {
    /// Defaults rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_cached_repos: DEFAULT_MAX_CACHED_REPOS,
            default_strategy: BranchStrategy::default(),
            workers: DEFAULT_WORKERS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            orphan_policy: OrphanPolicy::default(),
        }
    }

    /// Reject settings the cache cannot run with.
    ///
    /// # Errors
    /// Returns [`CacheError::Config`] describing the first invalid field.
    pub fn validate(&self) -> CacheResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(CacheError::Config("cache root must not be empty".into()));
        }
        if self.max_cached_repos == 0 {
            return Err(CacheError::Config("max_cached_repos must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(CacheError::Config("workers must be at least 1".into()));
        }
        if self.lock_timeout.is_zero() || self.operation_timeout.is_zero() {
            return Err(CacheError::Config("timeouts must be greater than zero".into()));
        }
        Ok(())
    }
}
