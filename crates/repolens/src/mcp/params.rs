//! Parameter definitions for MCP tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for cloning a repository into the cache.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CloneRepoParams {
    /// Repository URL or local path.
    pub url: String,
    /// Branch to check out. Defaults to the remote's default branch.
    #[serde(default)]
    pub branch: Option<String>,
    /// Workspace strategy: `shared` (one checkout switched between branches)
    /// or `per-branch` (one checkout per branch). Defaults to the configured strategy.
    #[serde(default)]
    pub cache_strategy: Option<String>,
    /// Seconds to wait for the clone before answering `pending`. Zero returns immediately.
    #[serde(default)]
    pub wait_secs: u64,
}

/// Parameters for refreshing a cached repository.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RefreshRepoParams {
    /// Repository URL or path as passed to `clone_repo`.
    pub repo_path: String,
    /// Branch to refresh. Defaults to the cached default branch.
    #[serde(default)]
    pub branch: Option<String>,
    /// Workspace strategy used when the branch has no workspace yet.
    #[serde(default)]
    pub cache_strategy: Option<String>,
    /// Seconds to wait for the refresh before answering `pending`.
    #[serde(default)]
    pub wait_secs: u64,
}

/// Parameters for polling a repository.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetRepoStatusParams {
    /// Repository URL or path as passed to `clone_repo`.
    pub repo_path: String,
    /// Seconds to wait for a running clone or refresh to finish.
    #[serde(default)]
    pub wait_secs: u64,
}

/// Parameters naming a repository by URL.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RepoUrlParams {
    /// Repository URL or local path.
    pub repo_url: String,
}

/// Parameters for removing a repository from the cache.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RemoveRepoParams {
    /// Repository URL or path as passed to `clone_repo`.
    pub repo_path: String,
}

/// Parameters for reading a file or directory.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetRepoFileContentParams {
    /// Repository URL or path as passed to `clone_repo`.
    pub repo_path: String,
    /// File or directory inside the repository. Defaults to the root.
    #[serde(default)]
    pub resource_path: Option<String>,
    /// Branch to read. Defaults to the cached default branch.
    #[serde(default)]
    pub branch: Option<String>,
    /// Maximum bytes of file content to return.
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

/// Parameters for summarizing the source layout.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetRepoStructureParams {
    /// Repository URL or path as passed to `clone_repo`.
    pub repo_path: String,
    /// Directories to limit the summary to.
    #[serde(default)]
    pub directories: Vec<String>,
    /// Include file names per directory.
    #[serde(default)]
    pub include_files: bool,
    /// Branch to read. Defaults to the cached default branch.
    #[serde(default)]
    pub branch: Option<String>,
}

/// Parameters for listing documentation files.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetRepoDocumentationParams {
    /// Repository URL or path as passed to `clone_repo`.
    pub repo_path: String,
    /// Branch to read. Defaults to the cached default branch.
    #[serde(default)]
    pub branch: Option<String>,
}
