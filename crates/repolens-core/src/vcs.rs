//! Contract for the version-control collaborator.
//!
//! The cache never runs clone/fetch/checkout itself; it calls an implementation
//! of [`VersionControl`] from a blocking worker thread. Implementations must be
//! safe to call concurrently for different destinations.

use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Failure classes reported by a collaborator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum VcsErrorKind {
    /// Transport failure.
    Network,
    /// Authentication failure.
    Auth,
    /// Repository, branch or ref missing.
    NotFound,
    /// Local tree has changes that block the update.
    Dirty,
    /// Local filesystem failure.
    Disk,
    /// Aborted through the cancellation callback.
    Cancelled,
    /// Anything else.
    Other,
}

impl fmt::Display for VcsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::NotFound => "not-found",
            Self::Dirty => "local-tree-dirty",
            Self::Disk => "disk",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Classified collaborator failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct VcsError {
    /// Failure class.
    pub kind: VcsErrorKind,
    /// Detail.
    pub message: String,
}

impl VcsError {
    /// Build an error of `kind`.
    pub fn new(kind: VcsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for VcsError {
    fn from(err: std::io::Error) -> Self {
        Self::new(VcsErrorKind::Disk, err.to_string())
    }
}

/// Branch and commit left on disk by a clone or checkout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutInfo {
    /// Checked-out branch.
    pub branch: String,
    /// Commit at `HEAD`.
    pub head_commit: String,
}

/// Result of fetching a branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The remote branch points at a different commit than the workspace.
    Updated(String),
    /// Nothing to do.
    Unchanged,
}

/// What an existing directory on disk contains.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceInfo {
    /// URL of the `origin` remote, if any.
    pub origin_url: Option<String>,
    /// Branch at `HEAD`.
    pub branch: String,
    /// Commit at `HEAD`.
    pub head_commit: String,
}

/// Returns `true` once the running operation should stop.
pub type CancelCheck<'a> = &'a (dyn Fn() -> bool + Sync);

/// Version-control primitives the cache depends on.
pub trait VersionControl: Send + Sync {
    /// Clone `source` into `dest`, checking out `branch` or the remote default.
    ///
    /// # Errors
    /// Returns a classified [`VcsError`]; `dest` may be left partially written.
    fn clone_branch(
        &self,
        source: &str,
        dest: &Path,
        branch: Option<&str>,
        cancelled: CancelCheck<'_>,
    ) -> Result<CheckoutInfo, VcsError>;

    /// Fetch `branch` from `origin` without touching the working tree.
    ///
    /// # Errors
    /// Returns a classified [`VcsError`]; `NotFound` when the branch is gone.
    fn fetch(
        &self,
        workspace: &Path,
        branch: &str,
        cancelled: CancelCheck<'_>,
    ) -> Result<FetchOutcome, VcsError>;

    /// Point the working tree at the fetched head of `branch`.
    ///
    /// # Errors
    /// Returns a classified [`VcsError`].
    fn checkout(&self, workspace: &Path, branch: &str) -> Result<CheckoutInfo, VcsError>;

    /// Branch names advertised by `source`.
    ///
    /// # Errors
    /// Returns a classified [`VcsError`].
    fn list_remote_branches(&self, source: &str) -> Result<Vec<String>, VcsError>;

    /// Describe an existing workspace directory.
    ///
    /// # Errors
    /// Returns `NotFound` when `workspace` is not a repository.
    fn inspect(&self, workspace: &Path) -> Result<WorkspaceInfo, VcsError>;
}
