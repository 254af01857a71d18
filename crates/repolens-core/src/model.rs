use crate::error::{CacheError, FailureKind};
use crate::identity::RepoIdentity;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fmt, str::FromStr};
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle state of a cached repository.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Initial clone in progress.
    Cloning,
    /// Usable.
    Ready,
    /// Fetch or checkout in progress.
    Refreshing,
    /// Last clone or refresh failed; see [`RepositoryEntry::failure`].
    Failed,
    /// Removal started but did not finish.
    Evicting,
}

impl EntryState {
    /// Whether a clone or refresh currently owns the entry.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Cloning | Self::Refreshing)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Cloning => "cloning",
            Self::Ready => "ready",
            Self::Refreshing => "refreshing",
            Self::Failed => "failed",
            Self::Evicting => "evicting",
        };
        f.write_str(label)
    }
}

/// How a requested branch maps onto workspaces.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchStrategy {
    /// One workspace per repository, switched between branches in place.
    #[default]
    Shared,
    /// One workspace per branch.
    PerBranch,
}

impl fmt::Display for BranchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::PerBranch => f.write_str("per-branch"),
        }
    }
}

/// Raised when a strategy name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown branch strategy `{0}` (expected `shared` or `per-branch`)")]
pub struct UnknownStrategy(pub String);

impl FromStr for BranchStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "per-branch" | "per_branch" | "perbranch" => Ok(Self::PerBranch),
            other => Err(UnknownStrategy(other.to_owned())),
        }
    }
}

/// Key of a workspace inside a [`RepositoryEntry`].
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum WorkspaceKey {
    /// The single shared workspace.
    Shared,
    /// A dedicated workspace for one branch.
    Branch(String),
}

impl WorkspaceKey {
    /// Key used for `branch` under `strategy`.
    #[must_use]
    pub fn for_branch(strategy: BranchStrategy, branch: &str) -> Self {
        match strategy {
            BranchStrategy::Shared => Self::Shared,
            BranchStrategy::PerBranch => Self::Branch(branch.to_owned()),
        }
    }
}

impl fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Branch(name) => write!(f, "branch:{name}"),
        }
    }
}

/// Raised when a serialized workspace key is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid workspace key `{0}`")]
pub struct InvalidWorkspaceKey(pub String);

impl FromStr for WorkspaceKey {
    type Err = InvalidWorkspaceKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "shared" {
            return Ok(Self::Shared);
        }
        match s.strip_prefix("branch:") {
            Some(name) if !name.is_empty() => Ok(Self::Branch(name.to_owned())),
            _ => Err(InvalidWorkspaceKey(s.to_owned())),
        }
    }
}

impl Serialize for WorkspaceKey {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WorkspaceKey {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Checked-out tree for one branch of one repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchWorkspace {
    /// Branch currently checked out.
    pub branch: String,
    /// Directory holding the tree.
    pub path: PathBuf,
    /// Last known commit id of `branch`.
    pub head_commit: String,
    /// Strategy the workspace was created under.
    pub strategy: BranchStrategy,
    /// Active readers. Never persisted; rebuilt from live leases.
    #[serde(skip)]
    pub in_use_count: usize,
    /// When the workspace last moved to a new head.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Which background operation produced a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Initial clone.
    Clone,
    /// Fetch and checkout of an existing entry.
    Refresh,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clone => f.write_str("clone"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// Failure retained on an entry until the next successful operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Operation that failed.
    pub operation: OperationKind,
    /// Failure class.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
    /// When it happened.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl FailureRecord {
    /// Record `err` as the outcome of `operation`, stamped now.
    #[must_use]
    pub fn new(operation: OperationKind, err: &CacheError) -> Self {
        Self {
            operation,
            kind: err.failure_kind(),
            message: err.to_string(),
            at: OffsetDateTime::now_utc(),
        }
    }
}

/// Opaque token identifying the mutation that currently owns an entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct LockToken(pub Uuid);

impl LockToken {
    /// Issue a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cached record for one repository identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEntry {
    /// Canonical key.
    pub identity: RepoIdentity,
    /// Location used for cloning and fetching.
    pub source: String,
    /// Directory owning every workspace of this entry.
    pub root_path: PathBuf,
    /// Branch the remote reported as default at clone time.
    #[serde(default)]
    pub default_branch: Option<String>,
    /// Workspaces keyed by strategy slot.
    #[serde(default)]
    pub workspaces: BTreeMap<WorkspaceKey, BranchWorkspace>,
    /// Last successful lookup or refresh.
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
    /// Approximate on-disk footprint.
    #[serde(default)]
    pub size_bytes: u64,
    /// Lifecycle state.
    pub state: EntryState,
    /// Last failure, if the entry is `Failed`.
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    /// Held while a mutation is in flight; never persisted.
    #[serde(skip)]
    pub lock_token: Option<LockToken>,
}

impl RepositoryEntry {
    /// Fresh entry in the `Cloning` state.
    #[must_use]
    pub fn cloning(identity: RepoIdentity, source: impl Into<String>, root_path: PathBuf) -> Self {
        Self {
            identity,
            source: source.into(),
            root_path,
            default_branch: None,
            workspaces: BTreeMap::new(),
            last_accessed: OffsetDateTime::now_utc(),
            size_bytes: 0,
            state: EntryState::Cloning,
            failure: None,
            lock_token: Some(LockToken::new()),
        }
    }

    /// Whether any workspace has active readers.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.workspaces.values().any(|ws| ws.in_use_count > 0)
    }

    /// Whether the eviction policy may select this entry.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        !self.state.is_in_flight() && !self.is_in_use()
    }

    /// Workspace currently holding `branch`, under any strategy.
    ///
    /// A dedicated per-branch workspace wins over the shared one.
    #[must_use]
    pub fn find_workspace(&self, branch: &str) -> Option<(&WorkspaceKey, &BranchWorkspace)> {
        self.workspaces
            .get_key_value(&WorkspaceKey::Branch(branch.to_owned()))
            .or_else(|| {
                self.workspaces
                    .get_key_value(&WorkspaceKey::Shared)
                    .filter(|(_, ws)| ws.branch == branch)
            })
    }

    /// Branch used when a caller does not name one.
    #[must_use]
    pub fn effective_branch<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        requested.or(self.default_branch.as_deref()).or_else(|| {
            self.workspaces.get(&WorkspaceKey::Shared).map(|ws| ws.branch.as_str())
        })
    }

    /// Whether this is the record of a clone that never produced a workspace.
    #[must_use]
    pub fn is_failed_clone(&self) -> bool {
        self.state == EntryState::Failed
            && self
                .failure
                .as_ref()
                .is_some_and(|failure| failure.operation == OperationKind::Clone)
    }

    /// Whether `path` lies inside this entry's root.
    #[must_use]
    pub fn owns_path(&self, path: &Path) -> bool {
        path.starts_with(&self.root_path)
    }
}
