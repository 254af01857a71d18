//! Domain types for the repository cache: identities, entries, workspaces,
//! errors and the version-control contract.

/// Error taxonomy.
pub mod error;
/// Source canonicalization.
pub mod identity;
/// Cache entries and workspaces.
pub mod model;
/// Version-control collaborator contract.
pub mod vcs;

pub use error::{CacheError, CacheResult, FailureKind};
pub use identity::{IdentityError, RepoIdentity, RepoSource, SourceKind};
pub use model::{
    BranchStrategy, BranchWorkspace, EntryState, FailureRecord, LockToken, OperationKind,
    RepositoryEntry, WorkspaceKey,
};
pub use vcs::{CancelCheck, CheckoutInfo, FetchOutcome, VcsError, VcsErrorKind, VersionControl, WorkspaceInfo};
