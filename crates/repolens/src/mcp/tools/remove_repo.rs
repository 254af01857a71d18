//! Remove repository tool implementation.

use super::common::{cache_error, json_result, parse_source};
use crate::mcp::params::RemoveRepoParams;
use repolens_cache::RepositoryCache;
use rmcp::ErrorData as McpError;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::CallToolResult;
use serde_json::json;

/// Delete a repository and its workspaces from the cache.
pub async fn handle_remove_repo(
    cache: &RepositoryCache,
    Parameters(params): Parameters<RemoveRepoParams>,
) -> Result<CallToolResult, McpError> {
    let source = parse_source(&params.repo_path)?;
    let removed = cache.remove(source.identity()).await.map_err(|e| cache_error(&e))?;
    json_result(&json!({
        "identity": source.identity(),
        "removed": removed,
    }))
}
