#![allow(dead_code, missing_docs, clippy::expect_used, clippy::unwrap_used)]

use anyhow::{Result, anyhow};
use repolens_cache::{CacheConfig, EntryStatus, RepositoryCache};
use repolens_core::{
    CancelCheck, CheckoutInfo, FetchOutcome, RepoSource, RepositoryEntry, VcsError, VcsErrorKind,
    VersionControl, WorkspaceInfo,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const META_FILE: &str = ".scripted-head";

/// Blocks collaborator calls until opened.
#[derive(Default)]
pub struct Gate {
    closed: Mutex<bool>,
    changed: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    pub fn open(&self) {
        *self.closed.lock().unwrap() = false;
        self.changed.notify_all();
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    fn pass(&self, cancelled: CancelCheck<'_>) -> Result<(), VcsError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut closed = self.closed.lock().unwrap();
        while *closed {
            if cancelled() {
                return Err(VcsError::new(VcsErrorKind::Cancelled, "cancelled at gate"));
            }
            closed = self
                .changed
                .wait_timeout(closed, Duration::from_millis(5))
                .unwrap()
                .0;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Remote {
    default_branch: String,
    branches: BTreeMap<String, String>,
}

/// In-memory version control: remotes are maps of branch to commit id and
/// workspaces are directories holding a small metadata file.
#[derive(Default)]
pub struct ScriptedVcs {
    remotes: Mutex<HashMap<String, Remote>>,
    clone_failures: Mutex<VecDeque<VcsErrorKind>>,
    fetch_failures: Mutex<VecDeque<VcsErrorKind>>,
    pub clone_gate: Gate,
    pub fetch_gate: Gate,
    pub checkout_gate: Gate,
    clones: AtomicUsize,
    fetches: AtomicUsize,
    checkouts: AtomicUsize,
    in_flight: Mutex<HashMap<String, Occupancy>>,
}

/// Concurrent collaborator calls against one remote.
#[derive(Default, Clone, Copy)]
struct Occupancy {
    current: usize,
    peak: usize,
}

/// Marks a collaborator call as running until dropped.
struct Occupied<'a> {
    vcs: &'a ScriptedVcs,
    origin: String,
}

impl Drop for Occupied<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.vcs.in_flight.lock().unwrap().get_mut(&self.origin) {
            slot.current -= 1;
        }
    }
}

impl ScriptedVcs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or update) `branch` of the remote at `location`.
    pub fn push(&self, location: &str, branch: &str, commit: &str) {
        let mut remotes = self.remotes.lock().unwrap();
        let remote = remotes.entry(location.to_owned()).or_default();
        if remote.default_branch.is_empty() {
            branch.clone_into(&mut remote.default_branch);
        }
        remote.branches.insert(branch.to_owned(), commit.to_owned());
    }

    pub fn delete_branch(&self, location: &str, branch: &str) {
        if let Some(remote) = self.remotes.lock().unwrap().get_mut(location) {
            remote.branches.remove(branch);
        }
    }

    pub fn fail_next_clone(&self, kind: VcsErrorKind) {
        self.clone_failures.lock().unwrap().push_back(kind);
    }

    pub fn fail_next_fetch(&self, kind: VcsErrorKind) {
        self.fetch_failures.lock().unwrap().push_back(kind);
    }

    pub fn clones(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn checkouts(&self) -> usize {
        self.checkouts.load(Ordering::SeqCst)
    }

    /// Most clone/fetch/checkout calls ever running at once against `location`.
    pub fn peak_in_flight(&self, location: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap()
            .get(location)
            .map_or(0, |slot| slot.peak)
    }

    fn occupy(&self, origin: &str) -> Occupied<'_> {
        let mut in_flight = self.in_flight.lock().unwrap();
        let slot = in_flight.entry(origin.to_owned()).or_default();
        slot.current += 1;
        slot.peak = slot.peak.max(slot.current);
        Occupied {
            vcs: self,
            origin: origin.to_owned(),
        }
    }

    fn remote_commit(&self, location: &str, branch: Option<&str>) -> Result<(String, String), VcsError> {
        let remotes = self.remotes.lock().unwrap();
        let remote = remotes
            .get(location)
            .ok_or_else(|| VcsError::new(VcsErrorKind::NotFound, format!("repository {location} not found")))?;
        let branch = branch.unwrap_or(&remote.default_branch);
        let commit = remote
            .branches
            .get(branch)
            .ok_or_else(|| VcsError::new(VcsErrorKind::NotFound, format!("branch {branch} not found")))?;
        Ok((branch.to_owned(), commit.clone()))
    }
}

fn write_meta(dir: &Path, origin: &str, branch: &str, commit: &str) -> Result<(), VcsError> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(META_FILE), format!("{origin}\n{branch}\n{commit}\n"))?;
    fs::write(dir.join("README.md"), format!("{branch}@{commit}\n"))?;
    Ok(())
}

fn read_meta(dir: &Path) -> Result<(String, String, String), VcsError> {
    let raw = fs::read_to_string(dir.join(META_FILE))?;
    let mut lines = raw.lines().map(str::to_owned);
    match (lines.next(), lines.next(), lines.next()) {
        (Some(origin), Some(branch), Some(commit)) => Ok((origin, branch, commit)),
        _ => Err(VcsError::new(VcsErrorKind::Other, "malformed workspace")),
    }
}

impl VersionControl for ScriptedVcs {
    fn clone_branch(
        &self,
        source: &str,
        dest: &Path,
        branch: Option<&str>,
        cancelled: CancelCheck<'_>,
    ) -> Result<CheckoutInfo, VcsError> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        let _occupied = self.occupy(source);
        // Something lands on disk before the transfer can fail.
        fs::create_dir_all(dest)?;
        fs::write(dest.join("partial"), b"...")?;
        self.clone_gate.pass(cancelled)?;
        if let Some(kind) = self.clone_failures.lock().unwrap().pop_front() {
            return Err(VcsError::new(kind, "scripted clone failure"));
        }
        let (branch, commit) = self.remote_commit(source, branch)?;
        fs::remove_file(dest.join("partial"))?;
        write_meta(dest, source, &branch, &commit)?;
        Ok(CheckoutInfo {
            branch,
            head_commit: commit,
        })
    }

    fn fetch(
        &self,
        workspace: &Path,
        branch: &str,
        cancelled: CancelCheck<'_>,
    ) -> Result<FetchOutcome, VcsError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (origin, current_branch, current_commit) = read_meta(workspace)?;
        let _occupied = self.occupy(&origin);
        self.fetch_gate.pass(cancelled)?;
        if let Some(kind) = self.fetch_failures.lock().unwrap().pop_front() {
            return Err(VcsError::new(kind, "scripted fetch failure"));
        }
        let (_, commit) = self.remote_commit(&origin, Some(branch))?;
        if current_branch == branch && current_commit == commit {
            Ok(FetchOutcome::Unchanged)
        } else {
            Ok(FetchOutcome::Updated(commit))
        }
    }

    fn checkout(&self, workspace: &Path, branch: &str) -> Result<CheckoutInfo, VcsError> {
        self.checkouts.fetch_add(1, Ordering::SeqCst);
        let (origin, _, _) = read_meta(workspace)?;
        let _occupied = self.occupy(&origin);
        self.checkout_gate.pass(&|| false)?;
        let (branch, commit) = self.remote_commit(&origin, Some(branch))?;
        write_meta(workspace, &origin, &branch, &commit)?;
        Ok(CheckoutInfo {
            branch,
            head_commit: commit,
        })
    }

    fn list_remote_branches(&self, source: &str) -> Result<Vec<String>, VcsError> {
        let remotes = self.remotes.lock().unwrap();
        let remote = remotes
            .get(source)
            .ok_or_else(|| VcsError::new(VcsErrorKind::NotFound, format!("repository {source} not found")))?;
        Ok(remote.branches.keys().cloned().collect())
    }

    fn inspect(&self, workspace: &Path) -> Result<WorkspaceInfo, VcsError> {
        let (origin, branch, commit) = read_meta(workspace)?;
        Ok(WorkspaceInfo {
            origin_url: Some(origin),
            branch,
            head_commit: commit,
        })
    }
}

pub fn source(name: &str) -> RepoSource {
    RepoSource::parse(&format!("https://example.com/acme/{name}")).expect("valid source")
}

/// Source whose remote has a `main` branch at `commit`.
pub fn remote(vcs: &ScriptedVcs, name: &str, commit: &str) -> RepoSource {
    let source = source(name);
    vcs.push(source.location(), "main", commit);
    source
}

pub fn config(root: &Path) -> CacheConfig {
    let mut config = CacheConfig::new(root);
    config.lock_timeout = Duration::from_secs(5);
    config.operation_timeout = Duration::from_secs(30);
    config
}

pub fn open(root: &Path, vcs: &Arc<ScriptedVcs>) -> Result<RepositoryCache> {
    open_with(root, vcs, |_| {})
}

pub fn open_with(
    root: &Path,
    vcs: &Arc<ScriptedVcs>,
    tweak: impl FnOnce(&mut CacheConfig),
) -> Result<RepositoryCache> {
    let mut config = config(root);
    tweak(&mut config);
    let vcs: Arc<dyn VersionControl> = Arc::clone(vcs) as Arc<dyn VersionControl>;
    Ok(RepositoryCache::open(config, vcs)?)
}

/// Resolve a status to the entry it settles on.
pub async fn settle(status: EntryStatus) -> Result<RepositoryEntry> {
    match status {
        EntryStatus::Ready { entry, .. } => Ok(entry),
        EntryStatus::Pending { handle, .. } => handle.wait().await.map_err(|err| anyhow!("{err}")),
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..500 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(anyhow!("condition not reached in time"))
}
