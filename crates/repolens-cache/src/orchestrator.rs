//! Background clone and refresh jobs.
//!
//! Jobs run on the tokio runtime, bounded by a worker semaphore. Identical
//! requests that arrive while a job is still running share its
//! [`TaskHandle`]. Version-control calls run on the blocking pool and are
//! always awaited to completion: cancellation is observed through the check
//! passed to the collaborator and at the checkpoints between steps, so a
//! cancelled job never leaves a half-written workspace behind.

use crate::config::CacheConfig;
use crate::eviction::Evictor;
use crate::fs_util::dir_size;
use crate::index::CacheIndex;
use crate::lock::{LockCoordinator, LockGuard, LockMode, LockScope};
use crate::strategy::{STAGING_DIR, WorkspaceAction, plan, staging_dir, workspace_path};
use repolens_core::{
    BranchStrategy, BranchWorkspace, CacheError, CacheResult, CancelCheck, CheckoutInfo,
    EntryState, FailureKind, FailureRecord, FetchOutcome, LockToken, OperationKind,
    RepoIdentity, RepoSource, RepositoryEntry, VcsError, VcsErrorKind, VersionControl,
    WorkspaceKey,
};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Final result of a background job.
pub type TaskOutcome = Result<RepositoryEntry, Arc<CacheError>>;

/// Handle on a queued or running clone/refresh.
///
/// Handles are cheap to clone; every clone observes the same outcome and
/// cancels the same job.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: Uuid,
    identity: RepoIdentity,
    kind: OperationKind,
    outcome: watch::Receiver<Option<TaskOutcome>>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Unique id of the job.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Repository the job works on.
    #[must_use]
    pub const fn identity(&self) -> &RepoIdentity {
        &self.identity
    }

    /// Clone or refresh.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Whether the job has reported its outcome.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Outcome, if the job has finished.
    #[must_use]
    pub fn try_outcome(&self) -> Option<TaskOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the job to finish.
    pub async fn wait(&self) -> TaskOutcome {
        let mut outcome = self.outcome.clone();
        let waited = outcome.wait_for(Option::is_some).await.map(|value| value.clone());
        let finished = match waited {
            Ok(value) => value,
            Err(_) => outcome.borrow().clone(),
        };
        finished.unwrap_or_else(|| {
            Err(Arc::new(CacheError::TaskAborted(format!(
                "{} of {} ended without an outcome",
                self.kind, self.identity
            ))))
        })
    }

    /// Wait at most `limit`; `None` when the job is still running.
    pub async fn wait_timeout(&self, limit: Duration) -> Option<TaskOutcome> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }

    /// Request cancellation. Takes effect at the job's next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone)]
struct Job {
    kind: OperationKind,
    identity: RepoIdentity,
    location: String,
    root: PathBuf,
    branch: Option<String>,
    strategy: BranchStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InflightKey {
    identity: RepoIdentity,
    kind: OperationKind,
    branch: Option<String>,
    strategy: BranchStrategy,
}

impl From<&Job> for InflightKey {
    fn from(job: &Job) -> Self {
        Self {
            identity: job.identity.clone(),
            kind: job.kind,
            branch: job.branch.clone(),
            strategy: job.strategy,
        }
    }
}

/// Schedules clone and refresh jobs.
#[derive(Clone)]
pub struct CloneOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    index: Arc<CacheIndex>,
    locks: LockCoordinator,
    vcs: Arc<dyn VersionControl>,
    evictor: Arc<Evictor>,
    workers: Arc<Semaphore>,
    operation_timeout: Duration,
    runtime: Handle,
    tracker: TaskTracker,
    inflight: Mutex<HashMap<InflightKey, TaskHandle>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for CloneOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloneOrchestrator")
            .field("root", &self.inner.index.root())
            .field("available_workers", &self.inner.workers.available_permits())
            .field("in_flight", &self.in_flight().len())
            .finish_non_exhaustive()
    }
}

impl CloneOrchestrator {
    /// Orchestrator spawning onto `runtime`.
    #[must_use]
    pub fn new(
        config: &CacheConfig,
        index: Arc<CacheIndex>,
        locks: LockCoordinator,
        vcs: Arc<dyn VersionControl>,
        evictor: Arc<Evictor>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                index,
                locks,
                vcs,
                evictor,
                workers: Arc::new(Semaphore::new(config.workers)),
                operation_timeout: config.operation_timeout,
                runtime,
                tracker: TaskTracker::new(),
                inflight: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Queue a clone of `source`.
    ///
    /// `branch` of `None` clones the remote default branch and records it as
    /// the entry's default.
    #[must_use]
    pub fn submit_clone(
        &self,
        source: &RepoSource,
        branch: Option<&str>,
        strategy: BranchStrategy,
    ) -> TaskHandle {
        self.submit(Job {
            kind: OperationKind::Clone,
            identity: source.identity().clone(),
            location: source.location().to_owned(),
            root: source.root_path(self.inner.index.root()),
            branch: branch.map(str::to_owned),
            strategy,
        })
    }

    /// Queue a refresh of `entry` for `branch`.
    #[must_use]
    pub fn submit_refresh(
        &self,
        entry: &RepositoryEntry,
        branch: Option<&str>,
        strategy: BranchStrategy,
    ) -> TaskHandle {
        self.submit(Job {
            kind: OperationKind::Refresh,
            identity: entry.identity.clone(),
            location: entry.source.clone(),
            root: entry.root_path.clone(),
            branch: branch.map(str::to_owned),
            strategy,
        })
    }

    /// Running job for `identity`, if any.
    #[must_use]
    pub fn find(&self, identity: &RepoIdentity) -> Option<TaskHandle> {
        self.in_flight()
            .into_iter()
            .find(|handle| handle.identity() == identity)
    }

    /// Every job that has not finished yet.
    #[must_use]
    pub fn in_flight(&self) -> Vec<TaskHandle> {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| !handle.is_finished())
            .cloned()
            .collect()
    }

    /// Cancel every job and wait for them to wind down.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("orchestrator stopped");
    }

    fn submit(&self, job: Job) -> TaskHandle {
        let key = InflightKey::from(&job);
        let mut inflight = self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inflight.get(&key)
            && !existing.is_finished()
        {
            debug!(identity = %job.identity, kind = %job.kind, task = %existing.id, "joined running job");
            return existing.clone();
        }

        let (sender, receiver) = watch::channel(None);
        let handle = TaskHandle {
            id: Uuid::now_v7(),
            identity: job.identity.clone(),
            kind: job.kind,
            outcome: receiver,
            cancel: self.inner.shutdown.child_token(),
        };
        inflight.insert(key.clone(), handle.clone());
        drop(inflight);

        debug!(identity = %job.identity, kind = %job.kind, branch = ?job.branch, task = %handle.id, "job queued");
        let inner = Arc::clone(&self.inner);
        let task = handle.clone();
        self.inner
            .tracker
            .spawn_on(inner.run(key, job, task, sender), &self.inner.runtime);
        handle
    }
}

/// Per-job cancellation scope: caller cancellation plus the operation deadline.
struct OpContext {
    token: CancellationToken,
    timed_out: Arc<AtomicBool>,
    timeout: Duration,
    timer: JoinHandle<()>,
}

impl OpContext {
    fn new(cancel: &CancellationToken, timeout: Duration) -> Self {
        let token = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = {
            let token = token.clone();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        timed_out.store(true, Ordering::Release);
                        token.cancel();
                    }
                    () = token.cancelled() => {}
                }
            })
        };
        Self {
            token,
            timed_out,
            timeout,
            timer,
        }
    }

    fn interrupted(&self) -> CacheError {
        if self.timed_out.load(Ordering::Acquire) {
            CacheError::Timeout(self.timeout)
        } else {
            CacheError::Cancelled
        }
    }

    fn checkpoint(&self) -> CacheResult<()> {
        if self.token.is_cancelled() {
            return Err(self.interrupted());
        }
        Ok(())
    }

    async fn permit(&self, workers: &Arc<Semaphore>) -> CacheResult<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(self.interrupted()),
            permit = Arc::clone(workers).acquire_owned() => permit
                .map_err(|_| CacheError::TaskAborted("worker pool closed".into())),
        }
    }

    async fn lock(
        &self,
        locks: &LockCoordinator,
        identity: &RepoIdentity,
        root: &Path,
        scope: LockScope<'_>,
        mode: LockMode,
    ) -> CacheResult<LockGuard> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(self.interrupted()),
            guard = locks.acquire(identity, root, scope, mode) => guard,
        }
    }

    /// Run a collaborator call on the blocking pool.
    async fn vcs<T, F>(&self, vcs: &Arc<dyn VersionControl>, f: F) -> Result<T, VcsError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn VersionControl, CancelCheck<'_>) -> Result<T, VcsError> + Send + 'static,
    {
        let vcs = Arc::clone(vcs);
        let token = self.token.clone();
        tokio::task::spawn_blocking(move || {
            let cancelled = move || token.is_cancelled();
            f(vcs.as_ref(), &cancelled)
        })
        .await
        .unwrap_or_else(|err| Err(VcsError::new(VcsErrorKind::Other, format!("worker task failed: {err}"))))
    }

    fn clone_error(&self, err: VcsError) -> CacheError {
        if self.token.is_cancelled() {
            return self.interrupted();
        }
        CacheError::clone_failure(err)
    }

    fn refresh_error(&self, err: VcsError, identity: &RepoIdentity, branch: &str) -> CacheError {
        if self.token.is_cancelled() {
            return self.interrupted();
        }
        CacheError::refresh_failure(err, identity, branch)
    }
}

impl Drop for OpContext {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Result of bringing one workspace up to date.
struct Refreshed {
    key: WorkspaceKey,
    workspace: BranchWorkspace,
    default_branch: Option<String>,
    changed: bool,
    /// Held until the index records the new checkout, so a reader never
    /// sees the new tree under the old branch.
    checkout_lock: Option<LockGuard>,
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        key: InflightKey,
        job: Job,
        handle: TaskHandle,
        sender: watch::Sender<Option<TaskOutcome>>,
    ) {
        let outcome = self.execute(&job, &handle.cancel).await.map_err(Arc::new);
        match &outcome {
            Ok(entry) => info!(
                identity = %job.identity,
                kind = %job.kind,
                state = %entry.state,
                bytes = entry.size_bytes,
                "job finished"
            ),
            Err(err) => warn!(identity = %job.identity, kind = %job.kind, error = %err, "job failed"),
        }

        // Every completed job may have pushed the cache over capacity.
        if let Err(err) = self.evictor.enforce(Some(&job.identity)).await {
            warn!(error = %err, "capacity enforcement failed");
        }

        sender.send_replace(Some(outcome));
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.get(&key).is_some_and(|running| running.id == handle.id) {
            inflight.remove(&key);
        }
    }

    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> CacheResult<RepositoryEntry> {
        let ctx = OpContext::new(cancel, self.operation_timeout);
        // Mutation lock before the permit: a job queued behind a busy
        // repository must not hold a worker slot while it waits.
        let _mutation = ctx
            .lock(&self.locks, &job.identity, &job.root, LockScope::Mutation, LockMode::Exclusive)
            .await?;
        let _permit = ctx.permit(&self.workers).await?;
        ctx.checkpoint()?;

        // Another process or an earlier job may have changed the entry while we queued.
        match self.index.lookup(&job.identity) {
            Some(entry) if needs_clone(&entry) => self.do_clone(&ctx, job, Some(entry)).await,
            Some(entry) => self.do_refresh(&ctx, job, entry).await,
            None if job.kind == OperationKind::Clone => self.do_clone(&ctx, job, None).await,
            None => Err(CacheError::NotCached(job.identity.clone())),
        }
    }

    async fn do_clone(
        &self,
        ctx: &OpContext,
        job: &Job,
        previous: Option<RepositoryEntry>,
    ) -> CacheResult<RepositoryEntry> {
        let _repo = ctx
            .lock(&self.locks, &job.identity, &job.root, LockScope::Repository, LockMode::Exclusive)
            .await?;
        remove_tree(&job.root).await?;

        let mut entry = RepositoryEntry::cloning(job.identity.clone(), job.location.clone(), job.root.clone());
        entry.failure = previous.as_ref().and_then(|e| e.failure.clone());
        entry.default_branch = previous.as_ref().and_then(|e| e.default_branch.clone());
        self.index.upsert(entry.clone())?;
        info!(identity = %job.identity, branch = ?job.branch, strategy = %job.strategy, "cloning");

        let result = async {
            let (staging, checkout) = self.clone_staged(ctx, &job.location, &job.root, job.branch.as_deref()).await?;
            let key = WorkspaceKey::for_branch(job.strategy, &checkout.branch);
            let workspace = install(&staging, &job.root, &key, checkout, job.strategy).await?;
            Ok::<_, CacheError>((key, workspace))
        }
        .await;

        match result {
            Ok((key, workspace)) => {
                if job.branch.is_none() {
                    entry.default_branch = Some(workspace.branch.clone());
                }
                entry.workspaces.insert(key, workspace);
                entry.size_bytes = measure(&job.root).await;
                entry.state = EntryState::Ready;
                entry.failure = None;
                entry.lock_token = None;
                self.index.upsert(entry)
            }
            Err(err) => {
                if let Err(cleanup) = remove_tree(&job.root).await {
                    warn!(identity = %job.identity, error = %cleanup, "failed to clear partial clone");
                }
                match (&err, previous) {
                    (CacheError::Cancelled, Some(previous)) => {
                        self.index.upsert(previous)?;
                    }
                    (CacheError::Cancelled, None) => {
                        self.index.remove(&job.identity)?;
                    }
                    _ => {
                        entry.state = EntryState::Failed;
                        entry.failure = Some(FailureRecord::new(OperationKind::Clone, &err));
                        entry.workspaces.clear();
                        entry.size_bytes = 0;
                        entry.lock_token = None;
                        self.index.upsert(entry)?;
                    }
                }
                Err(err)
            }
        }
    }

    async fn do_refresh(
        &self,
        ctx: &OpContext,
        job: &Job,
        entry: RepositoryEntry,
    ) -> CacheResult<RepositoryEntry> {
        let _repo = ctx
            .lock(&self.locks, &job.identity, &entry.root_path, LockScope::Repository, LockMode::Shared)
            .await?;
        // Eviction may have removed the root while we waited for the lock.
        let entry = match self.index.lookup(&job.identity) {
            Some(current) if current.state != EntryState::Evicting && current.root_path.is_dir() => current,
            _ => {
                debug!(identity = %job.identity, "entry evicted before refresh started");
                return Err(CacheError::NotCached(job.identity.clone()));
            }
        };
        let previous_state = match entry.state {
            EntryState::Refreshing => EntryState::Ready,
            state => state,
        };
        let previous_failure = entry.failure.clone();
        self.index
            .update(&job.identity, |e| {
                e.state = EntryState::Refreshing;
                e.lock_token = Some(LockToken::new());
            })?
            .ok_or_else(|| CacheError::NotCached(job.identity.clone()))?;

        match self.refresh_workspace(ctx, job, &entry).await {
            Ok(Refreshed {
                key,
                workspace,
                default_branch,
                changed,
                checkout_lock,
            }) => {
                let size = if changed {
                    measure(&entry.root_path).await
                } else {
                    entry.size_bytes
                };
                let updated = self.index.update(&job.identity, |e| {
                    if let Some(default) = default_branch {
                        e.default_branch.get_or_insert(default);
                    }
                    e.workspaces.insert(key, workspace);
                    e.size_bytes = size;
                    e.state = EntryState::Ready;
                    e.failure = None;
                    e.lock_token = None;
                    e.last_accessed = OffsetDateTime::now_utc();
                })?;
                drop(checkout_lock);
                updated.ok_or_else(|| CacheError::NotCached(job.identity.clone()))
            }
            Err(err) => {
                let restore = matches!(
                    err,
                    CacheError::Cancelled | CacheError::BranchNotFound { .. } | CacheError::LockTimeout { .. }
                );
                self.index.update(&job.identity, |e| {
                    if restore {
                        e.state = previous_state;
                        e.failure = previous_failure;
                    } else {
                        e.state = EntryState::Failed;
                        e.failure = Some(FailureRecord::new(OperationKind::Refresh, &err));
                    }
                    e.lock_token = None;
                })?;
                Err(err)
            }
        }
    }

    async fn refresh_workspace(
        &self,
        ctx: &OpContext,
        job: &Job,
        entry: &RepositoryEntry,
    ) -> CacheResult<Refreshed> {
        let Some(branch) = job
            .branch
            .clone()
            .or_else(|| entry.effective_branch(None).map(str::to_owned))
        else {
            return self.materialize(ctx, job, entry, None).await;
        };

        match plan(job.strategy, entry, &branch) {
            WorkspaceAction::Materialize { .. } => self.materialize(ctx, job, entry, Some(&branch)).await,
            WorkspaceAction::Reuse { key, workspace } | WorkspaceAction::Switch { key, workspace } => {
                self.update_workspace(ctx, entry, key, workspace, &branch).await
            }
        }
    }

    /// Fetch `branch` into an existing workspace and check it out when needed.
    async fn update_workspace(
        &self,
        ctx: &OpContext,
        entry: &RepositoryEntry,
        key: WorkspaceKey,
        workspace: BranchWorkspace,
        branch: &str,
    ) -> CacheResult<Refreshed> {
        let identity = &entry.identity;
        let fetched = {
            let path = workspace.path.clone();
            let wanted = branch.to_owned();
            ctx.vcs(&self.vcs, move |vcs, cancelled| vcs.fetch(&path, &wanted, cancelled))
                .await
                .map_err(|err| ctx.refresh_error(err, identity, branch))?
        };

        let switching = workspace.branch != branch;
        if !switching && fetched == FetchOutcome::Unchanged {
            debug!(%identity, branch, "workspace already up to date");
            return Ok(Refreshed {
                key,
                workspace,
                default_branch: None,
                changed: false,
                checkout_lock: None,
            });
        }

        // Fetch only touched remote refs; the working tree changes from here on.
        let workspace_lock = ctx
            .lock(&self.locks, identity, &entry.root_path, LockScope::Workspace(&key), LockMode::Exclusive)
            .await?;
        ctx.checkpoint()?;
        let checkout = {
            let path = workspace.path.clone();
            let wanted = branch.to_owned();
            ctx.vcs(&self.vcs, move |vcs, _| vcs.checkout(&path, &wanted))
                .await
                .map_err(|err| ctx.refresh_error(err, identity, branch))?
        };
        if switching {
            info!(%identity, from = %workspace.branch, to = %checkout.branch, "switched shared workspace");
        }

        Ok(Refreshed {
            key,
            workspace: BranchWorkspace {
                branch: checkout.branch,
                path: workspace.path,
                head_commit: checkout.head_commit,
                strategy: workspace.strategy,
                in_use_count: 0,
                updated_at: OffsetDateTime::now_utc(),
            },
            default_branch: None,
            changed: true,
            checkout_lock: Some(workspace_lock),
        })
    }

    /// Clone a workspace that does not exist yet next to the existing ones.
    async fn materialize(
        &self,
        ctx: &OpContext,
        job: &Job,
        entry: &RepositoryEntry,
        branch: Option<&str>,
    ) -> CacheResult<Refreshed> {
        let (staging, checkout) = self
            .clone_staged(ctx, &entry.source, &entry.root_path, branch)
            .await
            .map_err(|err| match (err, branch) {
                (CacheError::CloneFailure { kind: FailureKind::NotFound, .. }, Some(branch)) => {
                    CacheError::BranchNotFound {
                        identity: entry.identity.clone(),
                        branch: branch.to_owned(),
                    }
                }
                (CacheError::CloneFailure { kind, message }, _) => CacheError::RefreshFailure { kind, message },
                (other, _) => other,
            })?;
        let default_branch = branch.is_none().then(|| checkout.branch.clone());
        let key = WorkspaceKey::for_branch(job.strategy, &checkout.branch);

        if let Some(existing) = entry.workspaces.get(&key) {
            // The default branch already had a workspace under this strategy.
            remove_tree(&staging).await?;
            return Ok(Refreshed {
                key,
                workspace: existing.clone(),
                default_branch,
                changed: false,
                checkout_lock: None,
            });
        }

        let workspace = install(&staging, &entry.root_path, &key, checkout, job.strategy).await?;
        info!(identity = %entry.identity, branch = %workspace.branch, strategy = %job.strategy, "materialized workspace");
        Ok(Refreshed {
            key,
            workspace,
            default_branch,
            changed: true,
            checkout_lock: None,
        })
    }

    /// Clone into a fresh staging directory under `root`.
    async fn clone_staged(
        &self,
        ctx: &OpContext,
        location: &str,
        root: &Path,
        branch: Option<&str>,
    ) -> CacheResult<(PathBuf, CheckoutInfo)> {
        ctx.checkpoint()?;
        let staging = staging_dir(root);
        tokio::fs::create_dir_all(root.join(STAGING_DIR)).await?;

        let result = {
            let location = location.to_owned();
            let dest = staging.clone();
            let branch = branch.map(str::to_owned);
            ctx.vcs(&self.vcs, move |vcs, cancelled| {
                vcs.clone_branch(&location, &dest, branch.as_deref(), cancelled)
            })
            .await
        };
        match result {
            Ok(checkout) => match ctx.checkpoint() {
                Ok(()) => Ok((staging, checkout)),
                Err(err) => {
                    discard_staging(&staging, root).await;
                    Err(err)
                }
            },
            Err(err) => {
                discard_staging(&staging, root).await;
                Err(ctx.clone_error(err))
            }
        }
    }
}

fn needs_clone(entry: &RepositoryEntry) -> bool {
    match entry.state {
        EntryState::Cloning | EntryState::Evicting => true,
        EntryState::Failed => entry.is_failed_clone() || entry.workspaces.is_empty(),
        EntryState::Ready | EntryState::Refreshing => entry.workspaces.is_empty(),
    }
}

/// Move a staged clone into its workspace slot.
async fn install(
    staging: &Path,
    root: &Path,
    key: &WorkspaceKey,
    checkout: CheckoutInfo,
    strategy: BranchStrategy,
) -> CacheResult<BranchWorkspace> {
    let target = workspace_path(root, key);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    remove_tree(&target).await?;
    tokio::fs::rename(staging, &target).await?;
    let _ = tokio::fs::remove_dir(root.join(STAGING_DIR)).await;
    Ok(BranchWorkspace {
        branch: checkout.branch,
        path: target,
        head_commit: checkout.head_commit,
        strategy,
        in_use_count: 0,
        updated_at: OffsetDateTime::now_utc(),
    })
}

async fn discard_staging(staging: &Path, root: &Path) {
    if let Err(err) = remove_tree(staging).await {
        warn!(path = %staging.display(), error = %err, "failed to discard staging directory");
    }
    let _ = tokio::fs::remove_dir(root.join(STAGING_DIR)).await;
}

async fn remove_tree(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

async fn measure(root: &Path) -> u64 {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size(&root))
        .await
        .unwrap_or_default()
}
