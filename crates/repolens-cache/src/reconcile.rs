//! Startup reconciliation of the manifest against the cache directory.

use crate::fs_util::{dir_size, prune_empty_parents, remove_dir_if_exists};
use crate::index::CacheIndex;
use crate::lock::LOCKS_DIR;
use crate::strategy::{BRANCHES_DIR, SHARED_DIR, STAGING_DIR};
use repolens_core::{
    BranchStrategy, BranchWorkspace, CacheResult, EntryState, RepoIdentity, RepoSource,
    RepositoryEntry, VersionControl, WorkspaceKey,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::{info, warn};

/// Directory (relative to the cache root) receiving quarantined directories.
pub const QUARANTINE_DIR: &str = ".quarantine";

/// What to do with directories the manifest does not know about.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrphanPolicy {
    /// Register recognisable repositories, quarantine the rest.
    #[default]
    Adopt,
    /// Delete them.
    Remove,
    /// Move them to `.quarantine/`.
    Quarantine,
}

/// Error returned when parsing an unknown orphan policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown orphan policy `{0}` (expected adopt, remove or quarantine)")]
pub struct UnknownOrphanPolicy(pub String);

impl FromStr for OrphanPolicy {
    type Err = UnknownOrphanPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adopt" => Ok(Self::Adopt),
            "remove" => Ok(Self::Remove),
            "quarantine" => Ok(Self::Quarantine),
            other => Err(UnknownOrphanPolicy(other.to_owned())),
        }
    }
}

/// Summary of a reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries dropped because their root is gone or their clone never finished.
    pub dropped: Vec<RepoIdentity>,
    /// Entries whose interrupted refresh was rolled back to `Ready`.
    pub recovered: Vec<RepoIdentity>,
    /// Orphan directories registered as entries.
    pub adopted: Vec<RepoIdentity>,
    /// Orphan directories deleted.
    pub removed: Vec<PathBuf>,
    /// Orphan directories moved into quarantine.
    pub quarantined: Vec<PathBuf>,
}

impl ReconcileReport {
    /// Whether the manifest and the disk disagreed.
    #[must_use]
    pub fn found_corruption(&self) -> bool {
        !(self.dropped.is_empty()
            && self.adopted.is_empty()
            && self.removed.is_empty()
            && self.quarantined.is_empty())
    }
}

/// Bring `index` and the cache directory back in line.
///
/// Runs before any operation is accepted, so no locks are taken.
///
/// # Errors
/// Returns an error when the manifest cannot be rewritten; filesystem
/// failures on individual orphans are logged and skipped.
pub fn reconcile(
    index: &CacheIndex,
    vcs: &dyn VersionControl,
    policy: OrphanPolicy,
) -> CacheResult<ReconcileReport> {
    let root = index.root().to_path_buf();
    let mut report = ReconcileReport::default();

    for entry in index.list_all() {
        reconcile_entry(index, &entry, &mut report)?;
    }

    let known: BTreeSet<PathBuf> = index.list_all().into_iter().map(|e| e.root_path).collect();
    let mut orphans = Vec::new();
    collect_orphans(&root, &root, &known, &mut orphans);

    for dir in orphans {
        let adopted = match policy {
            OrphanPolicy::Adopt => adopt(index, vcs, &root, &dir)?,
            OrphanPolicy::Remove | OrphanPolicy::Quarantine => None,
        };
        if let Some(identity) = adopted {
            info!(%identity, path = %dir.display(), "adopted orphan directory");
            report.adopted.push(identity);
            continue;
        }
        if policy == OrphanPolicy::Remove {
            match remove_dir_if_exists(&dir) {
                Ok(()) => report.removed.push(dir.clone()),
                Err(err) => warn!(path = %dir.display(), error = %err, "failed to remove orphan"),
            }
        } else {
            match quarantine(&root, &dir) {
                Ok(target) => report.quarantined.push(target),
                Err(err) => warn!(path = %dir.display(), error = %err, "failed to quarantine orphan"),
            }
        }
        prune_empty_parents(&dir, &root);
    }

    if report.found_corruption() {
        warn!(
            dropped = report.dropped.len(),
            adopted = report.adopted.len(),
            removed = report.removed.len(),
            quarantined = report.quarantined.len(),
            "cache manifest disagreed with disk; reconciled"
        );
    }
    Ok(report)
}

fn reconcile_entry(
    index: &CacheIndex,
    entry: &RepositoryEntry,
    report: &mut ReconcileReport,
) -> CacheResult<()> {
    let root_exists = entry.root_path.is_dir();

    // A clone that was running when the process stopped left nothing usable.
    if entry.state == EntryState::Cloning {
        if let Err(err) = remove_dir_if_exists(&entry.root_path) {
            warn!(identity = %entry.identity, error = %err, "failed to clear interrupted clone");
        }
        index.remove(&entry.identity)?;
        report.dropped.push(entry.identity.clone());
        return Ok(());
    }

    // Failed clones are kept without a directory; anything else needs one.
    if !root_exists && !entry.is_failed_clone() {
        index.remove(&entry.identity)?;
        report.dropped.push(entry.identity.clone());
        return Ok(());
    }

    let staging = entry.root_path.join(STAGING_DIR);
    if staging.exists()
        && let Err(err) = remove_dir_if_exists(&staging)
    {
        warn!(path = %staging.display(), error = %err, "failed to clear staging area");
    }

    let missing: Vec<WorkspaceKey> = entry
        .workspaces
        .iter()
        .filter(|(_, ws)| !ws.path.is_dir())
        .map(|(key, _)| key.clone())
        .collect();
    let interrupted = entry.state == EntryState::Refreshing;

    if interrupted || !missing.is_empty() {
        index.update(&entry.identity, |e| {
            for key in &missing {
                e.workspaces.remove(key);
            }
            if interrupted {
                e.state = EntryState::Ready;
            }
            e.lock_token = None;
        })?;
        if interrupted {
            report.recovered.push(entry.identity.clone());
        }
    }
    Ok(())
}

fn collect_orphans(dir: &Path, cache_root: &Path, known: &BTreeSet<PathBuf>, out: &mut Vec<PathBuf>) {
    let Ok(children) = fs::read_dir(dir) else {
        return;
    };
    for child in children.flatten() {
        let path = child.path();
        if !path.is_dir() || known.contains(&path) {
            continue;
        }
        if dir == cache_root {
            let name = child.file_name();
            if name == LOCKS_DIR || name == QUARANTINE_DIR {
                continue;
            }
        }

        let holds_known = known.iter().any(|root| root.starts_with(&path));
        if holds_known {
            collect_orphans(&path, cache_root, known, out);
        } else if looks_like_repository(&path) {
            out.push(path);
        } else if has_subdirs(&path) {
            collect_orphans(&path, cache_root, known, out);
            // Host and owner directories emptied by earlier evictions.
            if is_empty_dir(&path) {
                let _ = fs::remove_dir(&path);
            }
        } else if is_empty_dir(&path) {
            let _ = fs::remove_dir(&path);
        } else {
            out.push(path);
        }
    }
}

fn looks_like_repository(path: &Path) -> bool {
    path.join(SHARED_DIR).is_dir() || path.join(BRANCHES_DIR).is_dir() || path.join(".git").exists()
}

fn has_subdirs(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|entries| entries.flatten().any(|entry| entry.path().is_dir()))
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}

fn adopt(
    index: &CacheIndex,
    vcs: &dyn VersionControl,
    cache_root: &Path,
    dir: &Path,
) -> CacheResult<Option<RepoIdentity>> {
    let mut candidates = Vec::new();
    let shared = dir.join(SHARED_DIR);
    if shared.is_dir() {
        candidates.push((BranchStrategy::Shared, shared));
    }
    if let Ok(branches) = fs::read_dir(dir.join(BRANCHES_DIR)) {
        for branch_dir in branches.flatten() {
            candidates.push((BranchStrategy::PerBranch, branch_dir.path()));
        }
    }

    let mut source: Option<RepoSource> = None;
    let mut workspaces = Vec::new();
    for (strategy, path) in candidates {
        let Ok(info) = vcs.inspect(&path) else {
            continue;
        };
        let Some(parsed) = info.origin_url.as_deref().and_then(|url| RepoSource::parse(url).ok()) else {
            continue;
        };
        // Only directories laid out exactly where this identity would live.
        if parsed.root_path(cache_root) != dir {
            continue;
        }
        if source.as_ref().is_some_and(|known| known.identity() != parsed.identity()) {
            continue;
        }
        let key = WorkspaceKey::for_branch(strategy, &info.branch);
        workspaces.push((
            key,
            BranchWorkspace {
                branch: info.branch,
                path,
                head_commit: info.head_commit,
                strategy,
                in_use_count: 0,
                updated_at: OffsetDateTime::now_utc(),
            },
        ));
        source.get_or_insert(parsed);
    }

    let Some(source) = source else {
        return Ok(None);
    };
    let mut entry = RepositoryEntry::cloning(source.identity().clone(), source.location(), dir.to_path_buf());
    entry.state = EntryState::Ready;
    entry.lock_token = None;
    entry.default_branch = workspaces
        .iter()
        .find(|(key, _)| *key == WorkspaceKey::Shared)
        .map(|(_, ws)| ws.branch.clone());
    entry.workspaces = workspaces.into_iter().collect();
    entry.size_bytes = dir_size(dir);
    let identity = entry.identity.clone();
    index.upsert(entry)?;
    Ok(Some(identity))
}

fn quarantine(cache_root: &Path, dir: &Path) -> std::io::Result<PathBuf> {
    let target_dir = cache_root.join(QUARANTINE_DIR);
    fs::create_dir_all(&target_dir)?;
    let name = dir
        .file_name()
        .map_or_else(|| "orphan".to_owned(), |name| name.to_string_lossy().into_owned());
    let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let target = target_dir.join(format!("{name}-{stamp}"));
    fs::rename(dir, &target)?;
    warn!(from = %dir.display(), to = %target.display(), "quarantined orphan directory");
    Ok(target)
}
