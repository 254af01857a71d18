//! Authoritative registry of cached repositories.
//!
//! Readers get lock-free snapshots of an `Arc`'d map that writers replace
//! wholesale; mutations are serialized by a single writer mutex and persisted
//! to `manifest.json` before they return.

use crate::fs_util::write_atomic;
use repolens_core::{CacheResult, RepoIdentity, RepositoryEntry, WorkspaceKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use time::OffsetDateTime;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::block_in_place;
use tracing::{debug, warn};

/// File name of the persisted manifest.
pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_LOCK_FILE: &str = ".manifest.lock";
const MANIFEST_VERSION: u32 = 1;

type Entries = BTreeMap<RepoIdentity, RepositoryEntry>;
type ReaderKey = (RepoIdentity, WorkspaceKey);
type Readers = Arc<Mutex<HashMap<ReaderKey, usize>>>;

#[derive(Serialize, Deserialize)]
struct Manifest {
    version: u32,
    entries: Vec<RepositoryEntry>,
}

/// What loading the manifest found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Entries read from disk.
    pub loaded: usize,
    /// Where an unreadable manifest was moved, if it was.
    pub corrupt_backup: Option<PathBuf>,
}

/// In-memory index backed by the on-disk manifest.
#[derive(Debug)]
pub struct CacheIndex {
    root: PathBuf,
    snapshot: RwLock<Arc<Entries>>,
    writer: Mutex<()>,
    readers: Readers,
    dirty: AtomicBool,
}

impl CacheIndex {
    /// Load the manifest under `root`, starting empty when it is missing.
    ///
    /// An unreadable manifest is moved aside and the index starts empty;
    /// reconciliation then adopts whatever is still on disk.
    ///
    /// # Errors
    /// Returns an I/O error when the manifest exists but cannot be read or
    /// moved aside.
    pub fn load(root: &Path) -> CacheResult<(Self, LoadReport)> {
        fs::create_dir_all(root)?;
        let path = root.join(MANIFEST_FILE);
        let mut report = LoadReport::default();

        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Manifest>(&bytes) {
                Ok(manifest) if manifest.version == MANIFEST_VERSION => manifest.entries,
                Ok(manifest) => {
                    let backup = set_aside(&path)?;
                    warn!(version = manifest.version, backup = %backup.display(), "unsupported manifest version");
                    report.corrupt_backup = Some(backup);
                    Vec::new()
                }
                Err(err) => {
                    let backup = set_aside(&path)?;
                    warn!(error = %err, backup = %backup.display(), "manifest unreadable, starting empty");
                    report.corrupt_backup = Some(backup);
                    Vec::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        report.loaded = entries.len();
        let map: Entries = entries
            .into_iter()
            .map(|entry| (entry.identity.clone(), entry))
            .collect();
        debug!(root = %root.display(), entries = map.len(), "manifest loaded");

        let index = Self {
            root: root.to_path_buf(),
            snapshot: RwLock::new(Arc::new(map)),
            writer: Mutex::new(()),
            readers: Arc::new(Mutex::new(HashMap::new())),
            dirty: AtomicBool::new(false),
        };
        Ok((index, report))
    }

    /// Cache root the index belongs to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of one entry.
    #[must_use]
    pub fn lookup(&self, identity: &RepoIdentity) -> Option<RepositoryEntry> {
        let snapshot = self.current();
        snapshot.get(identity).cloned().map(|entry| self.decorate(entry))
    }

    /// Snapshot of every entry.
    #[must_use]
    pub fn list_all(&self) -> Vec<RepositoryEntry> {
        let snapshot = self.current();
        snapshot
            .values()
            .cloned()
            .map(|entry| self.decorate(entry))
            .collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current().len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    /// Insert or replace `entry`, stamping `last_accessed`.
    ///
    /// # Errors
    /// Returns an error when the manifest cannot be written.
    pub fn upsert(&self, mut entry: RepositoryEntry) -> CacheResult<RepositoryEntry> {
        entry.last_accessed = OffsetDateTime::now_utc();
        let stored = entry.clone();
        self.mutate(|entries| {
            entries.insert(stored.identity.clone(), stored);
        })?;
        Ok(self.decorate(entry))
    }

    /// Apply `f` to an existing entry.
    ///
    /// Returns the updated entry, or `None` when the identity is unknown.
    ///
    /// # Errors
    /// Returns an error when the manifest cannot be written.
    pub fn update<F>(&self, identity: &RepoIdentity, f: F) -> CacheResult<Option<RepositoryEntry>>
    where
        F: FnOnce(&mut RepositoryEntry),
    {
        let mut updated = None;
        self.mutate(|entries| {
            if let Some(entry) = entries.get_mut(identity) {
                f(entry);
                updated = Some(entry.clone());
            }
        })?;
        Ok(updated.map(|entry| self.decorate(entry)))
    }

    /// Remove an entry.
    ///
    /// # Errors
    /// Returns an error when the manifest cannot be written.
    pub fn remove(&self, identity: &RepoIdentity) -> CacheResult<Option<RepositoryEntry>> {
        let mut removed = None;
        self.mutate(|entries| removed = entries.remove(identity))?;
        Ok(removed)
    }

    /// Record an access without writing the manifest.
    pub fn touch(&self, identity: &RepoIdentity) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.current()).clone();
        if let Some(entry) = next.get_mut(identity) {
            entry.last_accessed = OffsetDateTime::now_utc();
            self.replace(next);
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Persist pending in-memory changes.
    ///
    /// # Errors
    /// Returns an error when the manifest cannot be written.
    pub fn flush(&self) -> CacheResult<()> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.dirty.load(Ordering::Acquire) {
            self.persist(&self.current())?;
        }
        Ok(())
    }

    /// Register an active reader of a workspace until the guard drops.
    #[must_use]
    pub fn acquire_reader(&self, identity: &RepoIdentity, key: &WorkspaceKey) -> ReaderGuard {
        let reader_key = (identity.clone(), key.clone());
        {
            let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
            *readers.entry(reader_key.clone()).or_insert(0) += 1;
        }
        ReaderGuard {
            readers: Arc::clone(&self.readers),
            key: reader_key,
        }
    }

    fn current(&self) -> Arc<Entries> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace(&self, next: Entries) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    fn mutate<F>(&self, f: F) -> CacheResult<()>
    where
        F: FnOnce(&mut Entries),
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.current()).clone();
        f(&mut next);
        self.persist(&next)?;
        self.replace(next);
        Ok(())
    }

    fn persist(&self, entries: &Entries) -> CacheResult<()> {
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            entries: entries.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        off_worker(|| self.write_manifest(&bytes))?;

        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn write_manifest(&self, bytes: &[u8]) -> io::Result<()> {
        // Serializes writers from other processes sharing the cache root.
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.root.join(MANIFEST_LOCK_FILE))?;
        fs2::FileExt::lock_exclusive(&lock_file)?;
        let written = write_atomic(&self.root.join(MANIFEST_FILE), bytes);
        if let Err(err) = fs2::FileExt::unlock(&lock_file) {
            warn!(error = %err, "failed to release manifest lock");
        }
        written
    }

    fn decorate(&self, mut entry: RepositoryEntry) -> RepositoryEntry {
        let readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, workspace) in &mut entry.workspaces {
            workspace.in_use_count = readers
                .get(&(entry.identity.clone(), key.clone()))
                .copied()
                .unwrap_or(0);
        }
        entry
    }
}

/// Run blocking manifest I/O without stalling the async workers of a
/// multi-threaded runtime. Outside such a runtime `f` runs in place.
fn off_worker<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => block_in_place(f),
        _ => f(),
    }
}

fn set_aside(path: &Path) -> io::Result<PathBuf> {
    let stamp = OffsetDateTime::now_utc().unix_timestamp();
    let backup = path.with_file_name(format!("{MANIFEST_FILE}.corrupt-{stamp}"));
    fs::rename(path, &backup)?;
    Ok(backup)
}

/// Active reader registration; decrements the workspace's `in_use_count` on drop.
#[derive(Debug)]
pub struct ReaderGuard {
    readers: Readers,
    key: ReaderKey,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = readers.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                readers.remove(&self.key);
            }
        }
    }
}
