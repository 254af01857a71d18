//! Capacity enforcement.
//!
//! Victims are chosen least-recently-used first among entries with no
//! readers and no clone or refresh in flight. When nothing can be evicted
//! the cache is allowed to run over capacity and reports [`CachePressure`]
//! instead of failing the request that pushed it there.

use crate::fs_util::prune_empty_parents;
use crate::index::CacheIndex;
use crate::lock::{LockCoordinator, LockGuard, LockMode, LockScope};
use repolens_core::{CacheError, CacheResult, EntryState, RepoIdentity, RepositoryEntry};
use serde::Serialize;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Over-capacity condition that eviction could not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachePressure {
    /// Entries in the index.
    pub entries: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// How many entries over capacity the cache is.
    pub shortfall: usize,
    /// Entries that could not be evicted because they are in use or busy.
    pub blocked: Vec<RepoIdentity>,
    /// When the condition was observed.
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

/// Victims selected by [`EvictionPolicy::consider_eviction`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Entries to remove, in order.
    pub victims: Vec<RepoIdentity>,
    /// Entries over capacity with no evictable candidate left.
    pub shortfall: usize,
    /// Entries skipped because they are in use or busy.
    pub blocked: Vec<RepoIdentity>,
}

/// Pure victim selection.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy;

impl EvictionPolicy {
    /// Pick the entries to evict so that at most `capacity` remain.
    ///
    /// Entries left half-removed by an earlier eviction go first, then the
    /// least recently accessed. `protect` is never selected.
    #[must_use]
    pub fn consider_eviction(
        entries: &[RepositoryEntry],
        capacity: usize,
        protect: Option<&RepoIdentity>,
    ) -> EvictionPlan {
        let over = entries.len().saturating_sub(capacity);
        if over == 0 {
            return EvictionPlan::default();
        }

        let (mut candidates, blocked): (Vec<&RepositoryEntry>, Vec<&RepositoryEntry>) = entries
            .iter()
            .filter(|entry| Some(&entry.identity) != protect)
            .partition(|entry| entry.is_evictable());
        candidates.sort_by(|a, b| {
            let a_key = (a.state != EntryState::Evicting, a.last_accessed, &a.identity);
            let b_key = (b.state != EntryState::Evicting, b.last_accessed, &b.identity);
            a_key.cmp(&b_key)
        });

        let victims: Vec<RepoIdentity> = candidates
            .into_iter()
            .take(over)
            .map(|entry| entry.identity.clone())
            .collect();
        EvictionPlan {
            shortfall: over - victims.len(),
            victims,
            blocked: blocked.into_iter().map(|entry| entry.identity.clone()).collect(),
        }
    }
}

/// Outcome of one enforcement pass.
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    /// Entries removed.
    pub evicted: Vec<RepoIdentity>,
    /// Victims that became busy before they could be removed.
    pub deferred: Vec<RepoIdentity>,
    /// Remaining over-capacity condition, if any.
    pub pressure: Option<CachePressure>,
}

/// Removes entries from disk and index.
#[derive(Debug)]
pub struct Evictor {
    index: Arc<CacheIndex>,
    locks: LockCoordinator,
    capacity: usize,
    pressure: Mutex<Option<CachePressure>>,
    pass: tokio::sync::Mutex<()>,
}

impl Evictor {
    /// Evictor keeping `index` at or below `capacity` entries.
    #[must_use]
    pub fn new(index: Arc<CacheIndex>, locks: LockCoordinator, capacity: usize) -> Self {
        Self {
            index,
            locks,
            capacity,
            pressure: Mutex::new(None),
            pass: tokio::sync::Mutex::new(()),
        }
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pressure observed by the last enforcement pass.
    #[must_use]
    pub fn pressure(&self) -> Option<CachePressure> {
        self.pressure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Evict until the index fits the capacity, sparing `protect`.
    ///
    /// Victims that turn busy between selection and removal are deferred to
    /// the next pass rather than waited for.
    ///
    /// # Errors
    /// Returns an error only when the manifest cannot be written.
    pub async fn enforce(&self, protect: Option<&RepoIdentity>) -> CacheResult<EvictionReport> {
        let _pass = self.pass.lock().await;
        let entries = self.index.list_all();
        let plan = EvictionPolicy::consider_eviction(&entries, self.capacity, protect);
        let mut report = EvictionReport::default();

        for victim in plan.victims {
            match self.evict(&victim, false).await {
                Ok(true) => report.evicted.push(victim),
                Ok(false) => {}
                Err(CacheError::EvictionBlocked { reason, .. }) => {
                    debug!(identity = %victim, %reason, "eviction deferred");
                    report.deferred.push(victim);
                }
                Err(err @ (CacheError::Io(_) | CacheError::Manifest(_))) => return Err(err),
                Err(err) => {
                    warn!(identity = %victim, error = %err, "eviction failed");
                    report.deferred.push(victim);
                }
            }
        }

        report.pressure = self.observe_pressure();
        if let Some(pressure) = &report.pressure {
            warn!(
                entries = pressure.entries,
                capacity = pressure.capacity,
                shortfall = pressure.shortfall,
                blocked = pressure.blocked.len(),
                "cache over capacity; no evictable entries"
            );
        }
        Ok(report)
    }

    /// Remove one entry from disk and index.
    ///
    /// With `wait` the repository lock is waited for up to the lock timeout;
    /// otherwise a contended lock fails fast. Returns `false` when the entry
    /// is already gone.
    ///
    /// # Errors
    /// Returns [`CacheError::EvictionBlocked`] when the entry has readers, an
    /// operation in flight, or its directory could not be removed.
    pub async fn evict(&self, identity: &RepoIdentity, wait: bool) -> CacheResult<bool> {
        let Some(entry) = self.index.lookup(identity) else {
            return Ok(false);
        };
        let _guards = self.lock_root(&entry, wait).await?;

        // Re-read under the lock; a reader or refresh may have started.
        let Some(entry) = self.index.lookup(identity) else {
            return Ok(false);
        };
        if entry.is_in_use() {
            return Err(blocked(identity, "workspace has active readers"));
        }
        if entry.state.is_in_flight() {
            return Err(blocked(identity, &format!("entry is {}", entry.state)));
        }

        self.index.update(identity, |e| e.state = EntryState::Evicting)?;
        match tokio::fs::remove_dir_all(&entry.root_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                // Left in `Evicting` so the next pass retries it first.
                warn!(%identity, path = %entry.root_path.display(), error = %err, "failed to remove repository directory");
                return Err(blocked(identity, &format!("could not remove directory: {err}")));
            }
        }
        self.index.remove(identity)?;
        prune_empty_parents(&entry.root_path, self.index.root());
        info!(%identity, bytes = entry.size_bytes, "evicted repository");
        Ok(true)
    }

    /// Mutation then repository lock, both exclusive. Holding the mutation
    /// lock keeps a queued clone or refresh from touching the root after it
    /// is deleted.
    async fn lock_root(&self, entry: &RepositoryEntry, wait: bool) -> CacheResult<(LockGuard, LockGuard)> {
        let mutation = self.lock_scope(entry, LockScope::Mutation, wait).await?;
        let repository = self.lock_scope(entry, LockScope::Repository, wait).await?;
        Ok((mutation, repository))
    }

    async fn lock_scope(&self, entry: &RepositoryEntry, scope: LockScope<'_>, wait: bool) -> CacheResult<LockGuard> {
        if wait {
            return self
                .locks
                .acquire(&entry.identity, &entry.root_path, scope, LockMode::Exclusive)
                .await;
        }
        self.locks
            .try_acquire(&entry.root_path, scope, LockMode::Exclusive)?
            .ok_or_else(|| blocked(&entry.identity, "repository is locked"))
    }

    fn observe_pressure(&self) -> Option<CachePressure> {
        let entries = self.index.list_all();
        let pressure = (entries.len() > self.capacity).then(|| CachePressure {
            entries: entries.len(),
            capacity: self.capacity,
            shortfall: entries.len() - self.capacity,
            blocked: entries
                .iter()
                .filter(|entry| !entry.is_evictable())
                .map(|entry| entry.identity.clone())
                .collect(),
            observed_at: OffsetDateTime::now_utc(),
        });
        *self.pressure.lock().unwrap_or_else(PoisonError::into_inner) = pressure.clone();
        pressure
    }
}

fn blocked(identity: &RepoIdentity, reason: &str) -> CacheError {
    CacheError::EvictionBlocked {
        identity: identity.clone(),
        reason: reason.to_owned(),
    }
}
