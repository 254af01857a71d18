//! Error taxonomy shared by the cache and its collaborators.

use crate::identity::{IdentityError, RepoIdentity};
use crate::vcs::{VcsError, VcsErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a clone or refresh failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Transport failure.
    Network,
    /// Credentials rejected or missing.
    Auth,
    /// Repository or branch does not exist upstream.
    NotFound,
    /// Local filesystem failure.
    Disk,
    /// Local tree could not be updated.
    Conflict,
    /// Operation exceeded its deadline.
    Timeout,
}

impl FailureKind {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Timeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::NotFound => "not-found",
            Self::Disk => "disk",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by the repository cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Clone did not produce a usable workspace.
    #[error("clone failed ({kind}): {message}")]
    CloneFailure {
        /// Failure class.
        kind: FailureKind,
        /// Detail from the collaborator.
        message: String,
    },

    /// Fetch or checkout of an existing entry failed.
    #[error("refresh failed ({kind}): {message}")]
    RefreshFailure {
        /// Failure class.
        kind: FailureKind,
        /// Detail from the collaborator.
        message: String,
    },

    /// A repository lock could not be taken in time.
    #[error("timed out after {waited:?} waiting for the lock on {identity}")]
    LockTimeout {
        /// Repository whose lock was contended.
        identity: RepoIdentity,
        /// How long we waited.
        waited: Duration,
    },

    /// The entry is in use or has an operation in flight.
    #[error("{identity} cannot be evicted: {reason}")]
    EvictionBlocked {
        /// Repository that could not be evicted.
        identity: RepoIdentity,
        /// Why.
        reason: String,
    },

    /// The branch has no workspace, or does not exist upstream.
    #[error("branch `{branch}` not found for {identity}")]
    BranchNotFound {
        /// Repository.
        identity: RepoIdentity,
        /// Requested branch.
        branch: String,
    },

    /// Manifest and disk disagree.
    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    /// The identity has no entry.
    #[error("{0} is not cached")]
    NotCached(RepoIdentity),

    /// The entry exists but is not usable yet.
    #[error("{identity} is not ready (state: {state})")]
    NotReady {
        /// Repository.
        identity: RepoIdentity,
        /// Current state label.
        state: String,
    },

    /// The source could not be canonicalized.
    #[error("invalid repository source: {0}")]
    InvalidSource(#[from] IdentityError),

    /// Configuration rejected before the cache opened.
    #[error("invalid cache configuration: {0}")]
    Config(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The whole operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A background task ended without reporting an outcome.
    #[error("background task aborted: {0}")]
    TaskAborted(String),

    /// Filesystem error outside a collaborator call.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The manifest could not be encoded or decoded.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// Unclassified version-control failure.
    #[error(transparent)]
    Vcs(#[from] VcsError),
}

impl CacheError {
    /// Whether the same request may succeed if repeated later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::EvictionBlocked { .. } | Self::Timeout(_) => true,
            Self::CloneFailure { kind, .. } | Self::RefreshFailure { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }

    /// Failure class, for errors that are recorded on an entry.
    #[must_use]
    pub const fn failure_kind(&self) -> FailureKind {
        match self {
            Self::CloneFailure { kind, .. } | Self::RefreshFailure { kind, .. } => *kind,
            Self::Timeout(_) | Self::LockTimeout { .. } => FailureKind::Timeout,
            Self::BranchNotFound { .. } | Self::NotCached(_) => FailureKind::NotFound,
            Self::Io(_) | Self::Manifest(_) | Self::CacheCorruption(_) => FailureKind::Disk,
            Self::Vcs(err) => clone_kind(err.kind),
            _ => FailureKind::Conflict,
        }
    }

    /// Wrap a collaborator error raised during a clone.
    #[must_use]
    pub fn clone_failure(err: VcsError) -> Self {
        if err.kind == VcsErrorKind::Cancelled {
            return Self::Cancelled;
        }
        Self::CloneFailure {
            kind: clone_kind(err.kind),
            message: err.message,
        }
    }

    /// Wrap a collaborator error raised during a refresh of `branch`.
    #[must_use]
    pub fn refresh_failure(err: VcsError, identity: &RepoIdentity, branch: &str) -> Self {
        let kind = match err.kind {
            VcsErrorKind::Cancelled => return Self::Cancelled,
            VcsErrorKind::NotFound => {
                return Self::BranchNotFound {
                    identity: identity.clone(),
                    branch: branch.to_owned(),
                };
            }
            VcsErrorKind::Network => FailureKind::Network,
            VcsErrorKind::Auth => FailureKind::Auth,
            VcsErrorKind::Disk => FailureKind::Disk,
            VcsErrorKind::Dirty | VcsErrorKind::Other => FailureKind::Conflict,
        };
        Self::RefreshFailure {
            kind,
            message: err.message,
        }
    }
}

const fn clone_kind(kind: VcsErrorKind) -> FailureKind {
    match kind {
        VcsErrorKind::Network => FailureKind::Network,
        VcsErrorKind::Auth => FailureKind::Auth,
        VcsErrorKind::NotFound => FailureKind::NotFound,
        VcsErrorKind::Dirty => FailureKind::Conflict,
        VcsErrorKind::Disk | VcsErrorKind::Cancelled | VcsErrorKind::Other => FailureKind::Disk,
    }
}

/// Result alias used across the cache crates.
pub type CacheResult<T> = Result<T, CacheError>;
