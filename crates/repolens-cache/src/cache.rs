//! The repository cache as seen by the protocol layer.

use crate::config::CacheConfig;
use crate::eviction::{CachePressure, EvictionReport, Evictor};
use crate::index::{CacheIndex, LoadReport, ReaderGuard};
use crate::lock::{LockCoordinator, LockGuard, LockMode, LockScope};
use crate::orchestrator::{CloneOrchestrator, TaskHandle};
use crate::reconcile::{ReconcileReport, reconcile};
use crate::strategy::{WorkspaceAction, plan};
use repolens_core::{
    BranchStrategy, BranchWorkspace, CacheError, CacheResult, EntryState, FailureRecord,
    RepoIdentity, RepoSource, RepositoryEntry, VersionControl, WorkspaceKey,
};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Answer to a request for a cached workspace.
#[derive(Debug, Clone)]
pub enum EntryStatus {
    /// The workspace is on disk and can be read now.
    Ready {
        /// Entry snapshot.
        entry: RepositoryEntry,
        /// Workspace serving the request.
        workspace: BranchWorkspace,
    },
    /// A clone or refresh was started or joined.
    Pending {
        /// Repository.
        identity: RepoIdentity,
        /// Handle to poll or await.
        handle: TaskHandle,
        /// Failure of the previous attempt, when this is a retry.
        previous_failure: Option<FailureRecord>,
    },
}

impl EntryStatus {
    /// Repository the status is about.
    #[must_use]
    pub const fn identity(&self) -> &RepoIdentity {
        match self {
            Self::Ready { entry, .. } => &entry.identity,
            Self::Pending { identity, .. } => identity,
        }
    }

    /// Handle of the background job, if one was started or joined.
    #[must_use]
    pub const fn handle(&self) -> Option<&TaskHandle> {
        match self {
            Self::Ready { .. } => None,
            Self::Pending { handle, .. } => Some(handle),
        }
    }
}

/// Everything known about one identity.
#[derive(Debug, Clone)]
pub struct RepoStatus {
    /// Repository.
    pub identity: RepoIdentity,
    /// Entry snapshot; `None` while a first clone is still queued.
    pub entry: Option<RepositoryEntry>,
    /// Running job, if any.
    pub task: Option<TaskHandle>,
}

/// One branch with a workspace on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedBranch {
    /// Branch name.
    pub branch: String,
    /// Commit checked out.
    pub head_commit: String,
    /// Strategy the workspace belongs to.
    pub strategy: BranchStrategy,
    /// Workspace directory.
    pub path: PathBuf,
    /// Active readers.
    pub in_use: usize,
}

/// Aggregate numbers for the whole cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSummary {
    /// Cache root.
    pub root: PathBuf,
    /// Entries in the index.
    pub entries: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Sum of entry sizes.
    pub total_bytes: u64,
    /// Entries ready to serve.
    pub ready: usize,
    /// Entries whose last operation failed.
    pub failed: usize,
    /// Jobs still running.
    pub in_flight: usize,
    /// Last over-capacity report.
    pub pressure: Option<CachePressure>,
}

/// What opening the cache found on disk.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    /// Manifest load result.
    pub load: LoadReport,
    /// Reconciliation result.
    pub reconcile: ReconcileReport,
}

/// A workspace held open for reading.
///
/// While the lease lives the workspace counts as in use, cannot be evicted,
/// and cannot be checked out to another commit. Fields drop in declaration
/// order: workspace lock, reader registration, repository lock.
#[derive(Debug)]
pub struct WorkspaceLease {
    _workspace_lock: LockGuard,
    _reader: ReaderGuard,
    _repository_lock: LockGuard,
    identity: RepoIdentity,
    key: WorkspaceKey,
    workspace: BranchWorkspace,
}

impl WorkspaceLease {
    /// Directory of the leased workspace.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.workspace.path
    }

    /// Branch checked out in the workspace.
    #[must_use]
    pub fn branch(&self) -> &str {
        &self.workspace.branch
    }

    /// Commit checked out in the workspace.
    #[must_use]
    pub fn head_commit(&self) -> &str {
        &self.workspace.head_commit
    }

    /// Repository the workspace belongs to.
    #[must_use]
    pub const fn identity(&self) -> &RepoIdentity {
        &self.identity
    }

    /// Slot of the workspace.
    #[must_use]
    pub const fn key(&self) -> &WorkspaceKey {
        &self.key
    }
}

/// Repository cache: index, locks, background jobs and eviction behind one API.
pub struct RepositoryCache {
    config: CacheConfig,
    index: Arc<CacheIndex>,
    locks: LockCoordinator,
    vcs: Arc<dyn VersionControl>,
    evictor: Arc<Evictor>,
    orchestrator: CloneOrchestrator,
    startup: StartupReport,
}

impl fmt::Debug for RepositoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryCache")
            .field("config", &self.config)
            .field("entries", &self.index.len())
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl RepositoryCache {
    /// Open the cache under `config.root`.
    ///
    /// Loads the manifest, reconciles it against the directory and flushes the
    /// result before any request is accepted. Must be called from within a
    /// tokio runtime; background jobs are spawned onto it.
    ///
    /// # Errors
    /// Returns [`CacheError::Config`] for invalid settings or a missing
    /// runtime, and I/O errors when the cache root cannot be prepared.
    pub fn open(config: CacheConfig, vcs: Arc<dyn VersionControl>) -> CacheResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|err| CacheError::Config(format!("a tokio runtime is required: {err}")))?;
        std::fs::create_dir_all(&config.root)?;

        let locks = LockCoordinator::new(&config.root, config.lock_timeout)?;
        let (index, load) = CacheIndex::load(&config.root)?;
        let reconciled = reconcile(&index, vcs.as_ref(), config.orphan_policy)?;
        index.flush()?;
        let index = Arc::new(index);

        let evictor = Arc::new(Evictor::new(Arc::clone(&index), locks.clone(), config.max_cached_repos));
        let orchestrator = CloneOrchestrator::new(
            &config,
            Arc::clone(&index),
            locks.clone(),
            Arc::clone(&vcs),
            Arc::clone(&evictor),
            runtime,
        );
        info!(
            root = %config.root.display(),
            entries = index.len(),
            capacity = config.max_cached_repos,
            strategy = %config.default_strategy,
            "repository cache opened"
        );

        Ok(Self {
            config,
            index,
            locks,
            vcs,
            evictor,
            orchestrator,
            startup: StartupReport {
                load,
                reconcile: reconciled,
            },
        })
    }

    /// Settings the cache runs with.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// What opening the cache found.
    #[must_use]
    pub const fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    /// Make `branch` of `source` available, cloning or refreshing as needed.
    ///
    /// Never waits for a clone or refresh: when the workspace is not on disk
    /// yet the answer is [`EntryStatus::Pending`] with a handle to the job.
    /// A previously failed clone is retried.
    ///
    /// # Errors
    /// Returns an error only when the index cannot be read or written.
    pub fn ensure_cached(
        &self,
        source: &RepoSource,
        branch: Option<&str>,
        strategy: Option<BranchStrategy>,
    ) -> CacheResult<EntryStatus> {
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        let identity = source.identity();

        let Some(entry) = self.index.lookup(identity) else {
            return Ok(Self::pending(identity, self.clone_async(source, branch, Some(strategy)), None));
        };

        match entry.state {
            EntryState::Cloning => {
                let handle = self
                    .orchestrator
                    .find(identity)
                    .unwrap_or_else(|| self.clone_async(source, branch, Some(strategy)));
                return Ok(Self::pending(identity, handle, None));
            }
            EntryState::Evicting => {
                return Ok(Self::pending(identity, self.clone_async(source, branch, Some(strategy)), None));
            }
            _ if entry.is_failed_clone() => {
                debug!(%identity, "retrying failed clone");
                let handle = self.clone_async(source, branch, Some(strategy));
                return Ok(Self::pending(identity, handle, entry.failure));
            }
            _ => {}
        }

        let Some(branch) = entry.effective_branch(branch).map(str::to_owned) else {
            let handle = self.orchestrator.submit_refresh(&entry, None, strategy);
            return Ok(Self::pending(identity, handle, entry.failure));
        };
        match plan(strategy, &entry, &branch) {
            WorkspaceAction::Reuse { workspace, .. } => {
                self.index.touch(identity);
                let entry = self.index.lookup(identity).unwrap_or(entry);
                Ok(EntryStatus::Ready { entry, workspace })
            }
            WorkspaceAction::Switch { .. } | WorkspaceAction::Materialize { .. } => {
                let handle = self.orchestrator.submit_refresh(&entry, Some(&branch), strategy);
                Ok(Self::pending(identity, handle, entry.failure))
            }
        }
    }

    /// Fetch upstream changes for `branch` of a cached repository.
    ///
    /// Concurrent refreshes of the same branch share one job.
    ///
    /// # Errors
    /// Returns [`CacheError::NotCached`] for unknown identities.
    pub fn refresh(
        &self,
        identity: &RepoIdentity,
        branch: Option<&str>,
        strategy: Option<BranchStrategy>,
    ) -> CacheResult<EntryStatus> {
        let previous_failure = self.index.lookup(identity).and_then(|entry| entry.failure);
        let handle = self.refresh_async(identity, branch, strategy)?;
        Ok(Self::pending(identity, handle, previous_failure))
    }

    /// Start (or join) a clone of `source`.
    #[must_use]
    pub fn clone_async(
        &self,
        source: &RepoSource,
        branch: Option<&str>,
        strategy: Option<BranchStrategy>,
    ) -> TaskHandle {
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        self.orchestrator.submit_clone(source, branch, strategy)
    }

    /// Start (or join) a refresh of a cached repository.
    ///
    /// Entries whose clone failed or whose removal is pending are cloned again.
    ///
    /// # Errors
    /// Returns [`CacheError::NotCached`] for unknown identities.
    pub fn refresh_async(
        &self,
        identity: &RepoIdentity,
        branch: Option<&str>,
        strategy: Option<BranchStrategy>,
    ) -> CacheResult<TaskHandle> {
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        let entry = self
            .index
            .lookup(identity)
            .ok_or_else(|| CacheError::NotCached(identity.clone()))?;

        if entry.is_failed_clone() || entry.state == EntryState::Evicting {
            let source = RepoSource::parse(&entry.source)?;
            return Ok(self.orchestrator.submit_clone(&source, branch, strategy));
        }
        if entry.state == EntryState::Cloning
            && let Some(handle) = self.orchestrator.find(identity)
        {
            return Ok(handle);
        }
        let branch = entry.effective_branch(branch).map(str::to_owned);
        Ok(self.orchestrator.submit_refresh(&entry, branch.as_deref(), strategy))
    }

    /// Entry snapshot and running job for `identity`.
    ///
    /// # Errors
    /// Returns [`CacheError::NotCached`] when there is neither.
    pub fn status(&self, identity: &RepoIdentity) -> CacheResult<RepoStatus> {
        let entry = self.index.lookup(identity);
        let task = self.orchestrator.find(identity);
        if entry.is_none() && task.is_none() {
            return Err(CacheError::NotCached(identity.clone()));
        }
        Ok(RepoStatus {
            identity: identity.clone(),
            entry,
            task,
        })
    }

    /// Branches of `identity` that have a workspace on disk.
    ///
    /// # Errors
    /// Returns [`CacheError::NotCached`] for unknown identities.
    pub fn list_cached_branches(&self, identity: &RepoIdentity) -> CacheResult<Vec<CachedBranch>> {
        let entry = self
            .index
            .lookup(identity)
            .ok_or_else(|| CacheError::NotCached(identity.clone()))?;
        let mut branches: Vec<CachedBranch> = entry
            .workspaces
            .values()
            .map(|ws| CachedBranch {
                branch: ws.branch.clone(),
                head_commit: ws.head_commit.clone(),
                strategy: ws.strategy,
                path: ws.path.clone(),
                in_use: ws.in_use_count,
            })
            .collect();
        branches.sort_by(|a, b| a.branch.cmp(&b.branch).then_with(|| a.path.cmp(&b.path)));
        Ok(branches)
    }

    /// Branches advertised by the remote. Nothing is cached.
    ///
    /// # Errors
    /// Returns the collaborator's error when the remote cannot be listed.
    pub async fn list_remote_branches(&self, source: &RepoSource) -> CacheResult<Vec<String>> {
        let vcs = Arc::clone(&self.vcs);
        let location = source.location().to_owned();
        let branches = tokio::task::spawn_blocking(move || vcs.list_remote_branches(&location))
            .await
            .map_err(|err| CacheError::TaskAborted(err.to_string()))??;
        Ok(branches)
    }

    /// Directory of the workspace serving `branch` (or the default branch).
    ///
    /// The path is only stable while a lease is held; analysis code should
    /// use [`Self::lease_workspace`].
    ///
    /// # Errors
    /// Returns [`CacheError::NotCached`], [`CacheError::NotReady`] when no
    /// workspace exists yet, or [`CacheError::BranchNotFound`].
    pub fn resolve_workspace_path(&self, identity: &RepoIdentity, branch: Option<&str>) -> CacheResult<PathBuf> {
        let entry = self
            .index
            .lookup(identity)
            .ok_or_else(|| CacheError::NotCached(identity.clone()))?;
        let (_, workspace) = select_workspace(&entry, branch)?;
        let path = workspace.path.clone();
        self.index.touch(identity);
        Ok(path)
    }

    /// Hold a workspace open for reading.
    ///
    /// # Errors
    /// Same as [`Self::resolve_workspace_path`], plus
    /// [`CacheError::LockTimeout`] when a checkout holds the workspace longer
    /// than the lock timeout. A shared workspace switched to another branch
    /// while the lease waited yields [`CacheError::BranchNotFound`].
    pub async fn lease_workspace(
        &self,
        identity: &RepoIdentity,
        branch: Option<&str>,
    ) -> CacheResult<WorkspaceLease> {
        let entry = self
            .index
            .lookup(identity)
            .ok_or_else(|| CacheError::NotCached(identity.clone()))?;
        let repository_lock = self
            .locks
            .acquire(identity, &entry.root_path, LockScope::Repository, LockMode::Shared)
            .await?;

        // Re-read: an eviction or clone may have finished while we waited.
        let entry = self
            .index
            .lookup(identity)
            .ok_or_else(|| CacheError::NotCached(identity.clone()))?;
        let (key, selected) = select_workspace(&entry, branch)?;
        let key = key.clone();
        let wanted = selected.branch.clone();
        let reader = self.index.acquire_reader(identity, &key);
        let workspace_lock = self
            .locks
            .acquire(identity, &entry.root_path, LockScope::Workspace(&key), LockMode::Shared)
            .await?;

        // The workspace may have been switched while we waited for its lock.
        let entry = self
            .index
            .lookup(identity)
            .ok_or_else(|| CacheError::NotCached(identity.clone()))?;
        let workspace = entry
            .workspaces
            .get(&key)
            .cloned()
            .ok_or_else(|| CacheError::CacheCorruption(format!("workspace {key} of {identity} vanished")))?;
        if workspace.branch != wanted {
            debug!(%identity, %key, wanted = %wanted, found = %workspace.branch, "workspace switched while waiting");
            return Err(CacheError::BranchNotFound {
                identity: identity.clone(),
                branch: wanted,
            });
        }
        self.index.touch(identity);
        debug!(%identity, %key, branch = %workspace.branch, "workspace leased");

        Ok(WorkspaceLease {
            _workspace_lock: workspace_lock,
            _reader: reader,
            _repository_lock: repository_lock,
            identity: identity.clone(),
            key,
            workspace,
        })
    }

    /// Remove a repository from the cache.
    ///
    /// Returns `false` when it was not cached.
    ///
    /// # Errors
    /// Returns [`CacheError::EvictionBlocked`] while a job is running or a
    /// workspace is leased.
    pub async fn remove(&self, identity: &RepoIdentity) -> CacheResult<bool> {
        if let Some(task) = self.orchestrator.find(identity) {
            return Err(CacheError::EvictionBlocked {
                identity: identity.clone(),
                reason: format!("{} in flight", task.kind()),
            });
        }
        self.evictor.evict(identity, true).await
    }

    /// Run an eviction pass now.
    ///
    /// # Errors
    /// Returns an error when the manifest cannot be written.
    pub async fn enforce_capacity(&self) -> CacheResult<EvictionReport> {
        self.evictor.enforce(None).await
    }

    /// Snapshot of every entry.
    #[must_use]
    pub fn entries(&self) -> Vec<RepositoryEntry> {
        self.index.list_all()
    }

    /// Last over-capacity report, if the cache is still over capacity.
    #[must_use]
    pub fn pressure(&self) -> Option<CachePressure> {
        self.evictor.pressure()
    }

    /// Aggregate numbers for the whole cache.
    #[must_use]
    pub fn summary(&self) -> CacheSummary {
        let entries = self.index.list_all();
        CacheSummary {
            root: self.config.root.clone(),
            entries: entries.len(),
            capacity: self.evictor.capacity(),
            total_bytes: entries.iter().map(|entry| entry.size_bytes).sum(),
            ready: entries.iter().filter(|entry| entry.state == EntryState::Ready).count(),
            failed: entries.iter().filter(|entry| entry.state == EntryState::Failed).count(),
            in_flight: self.orchestrator.in_flight().len(),
            pressure: self.evictor.pressure(),
        }
    }

    /// Cancel running jobs, wait for them, and persist the index.
    ///
    /// # Errors
    /// Returns an error when the manifest cannot be written.
    pub async fn shutdown(&self) -> CacheResult<()> {
        self.orchestrator.shutdown().await;
        self.index.flush()?;
        info!(root = %self.config.root.display(), "repository cache closed");
        Ok(())
    }

    fn pending(
        identity: &RepoIdentity,
        handle: TaskHandle,
        previous_failure: Option<FailureRecord>,
    ) -> EntryStatus {
        debug!(%identity, task = %handle.id(), kind = %handle.kind(), "pending");
        EntryStatus::Pending {
            identity: identity.clone(),
            handle,
            previous_failure,
        }
    }
}

fn select_workspace<'a>(
    entry: &'a RepositoryEntry,
    branch: Option<&str>,
) -> CacheResult<(&'a WorkspaceKey, &'a BranchWorkspace)> {
    if entry.workspaces.is_empty() {
        return Err(CacheError::NotReady {
            identity: entry.identity.clone(),
            state: entry.state.to_string(),
        });
    }
    let Some(branch) = entry.effective_branch(branch) else {
        return Err(CacheError::NotReady {
            identity: entry.identity.clone(),
            state: entry.state.to_string(),
        });
    };
    entry
        .find_workspace(branch)
        .ok_or_else(|| CacheError::BranchNotFound {
            identity: entry.identity.clone(),
            branch: branch.to_owned(),
        })
}
