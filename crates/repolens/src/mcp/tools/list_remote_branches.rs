//! Remote branch listing tool implementation.

use super::common::{cache_error, json_result, parse_source};
use crate::mcp::params::RepoUrlParams;
use repolens_cache::RepositoryCache;
use rmcp::ErrorData as McpError;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::CallToolResult;
use serde_json::json;

/// Ask the remote which branches it has. Nothing is cached.
pub async fn handle_list_remote_branches(
    cache: &RepositoryCache,
    Parameters(params): Parameters<RepoUrlParams>,
) -> Result<CallToolResult, McpError> {
    let source = parse_source(&params.repo_url)?;
    let branches = cache
        .list_remote_branches(&source)
        .await
        .map_err(|e| cache_error(&e))?;
    json_result(&json!({
        "source": source.location(),
        "branches": branches,
    }))
}
