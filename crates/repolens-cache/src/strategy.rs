//! How a requested branch maps onto an on-disk workspace.
//!
//! Layout under a repository root:
//!
//! ```text
//! <root>/shared/                      shared strategy, one tree switched in place
//! <root>/branches/<branch>-<hash>/    per-branch strategy, one tree per branch
//! <root>/.staging/<uuid>/             clone in progress, renamed into place on success
//! ```

use repolens_core::identity::{sanitize_segment, short_hash};
use repolens_core::{BranchStrategy, BranchWorkspace, RepositoryEntry, WorkspaceKey};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory of the shared workspace.
pub const SHARED_DIR: &str = "shared";
/// Directory holding per-branch workspaces.
pub const BRANCHES_DIR: &str = "branches";
/// Directory holding in-progress clones.
pub const STAGING_DIR: &str = ".staging";

/// What a request needs done to serve `branch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceAction {
    /// The workspace already has the branch checked out.
    Reuse {
        /// Slot of the workspace.
        key: WorkspaceKey,
        /// The workspace.
        workspace: BranchWorkspace,
    },
    /// The shared workspace holds another branch and must be switched in place.
    Switch {
        /// Slot of the workspace.
        key: WorkspaceKey,
        /// The workspace before the switch.
        workspace: BranchWorkspace,
    },
    /// No workspace exists yet for this slot.
    Materialize {
        /// Slot to create.
        key: WorkspaceKey,
    },
}

impl WorkspaceAction {
    /// Slot the action applies to.
    #[must_use]
    pub const fn key(&self) -> &WorkspaceKey {
        match self {
            Self::Reuse { key, .. } | Self::Switch { key, .. } | Self::Materialize { key } => key,
        }
    }
}

/// Decide how `strategy` serves `branch` for `entry`.
///
/// Workspaces created under the other strategy are never touched: switching
/// strategy materializes new workspaces alongside the old ones.
#[must_use]
pub fn plan(strategy: BranchStrategy, entry: &RepositoryEntry, branch: &str) -> WorkspaceAction {
    let key = WorkspaceKey::for_branch(strategy, branch);
    match entry.workspaces.get(&key) {
        Some(workspace) if workspace.branch == branch => WorkspaceAction::Reuse {
            key,
            workspace: workspace.clone(),
        },
        Some(workspace) => WorkspaceAction::Switch {
            key,
            workspace: workspace.clone(),
        },
        None => WorkspaceAction::Materialize { key },
    }
}

/// Directory of the workspace in slot `key` under repository root `root`.
#[must_use]
pub fn workspace_path(root: &Path, key: &WorkspaceKey) -> PathBuf {
    match key {
        WorkspaceKey::Shared => root.join(SHARED_DIR),
        WorkspaceKey::Branch(branch) => root
            .join(BRANCHES_DIR)
            .join(format!("{}-{}", sanitize_segment(branch), short_hash(branch))),
    }
}

/// Fresh staging directory for a clone under `root`.
#[must_use]
pub fn staging_dir(root: &Path) -> PathBuf {
    root.join(STAGING_DIR).join(Uuid::now_v7().to_string())
}
