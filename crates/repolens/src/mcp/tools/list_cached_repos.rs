//! Cached repository listing tool implementation.

use super::common::json_result;
use repolens_cache::RepositoryCache;
use rmcp::ErrorData as McpError;
use rmcp::model::CallToolResult;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct CachedRepo {
    identity: String,
    source: String,
    state: String,
    default_branch: Option<String>,
    branches: Vec<String>,
    size_bytes: u64,
    root_path: PathBuf,
}

/// List every cached repository, most recently used first.
#[allow(clippy::unused_async)]
pub async fn handle_list_cached_repos(cache: &RepositoryCache) -> Result<CallToolResult, McpError> {
    let mut entries = cache.entries();
    entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
    let repos: Vec<CachedRepo> = entries
        .into_iter()
        .map(|entry| CachedRepo {
            identity: entry.identity.to_string(),
            source: entry.source,
            state: entry.state.to_string(),
            default_branch: entry.default_branch,
            branches: entry.workspaces.values().map(|ws| ws.branch.clone()).collect(),
            size_bytes: entry.size_bytes,
            root_path: entry.root_path,
        })
        .collect();
    json_result(&repos)
}
