//! Refresh repository tool implementation.

use super::common::{cache_error, json_result, parse_source, parse_strategy, status_json};
use crate::mcp::params::RefreshRepoParams;
use repolens_cache::RepositoryCache;
use rmcp::ErrorData as McpError;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::CallToolResult;
use std::time::Duration;

/// Fetch upstream changes for a cached repository.
pub async fn handle_refresh_repo(
    cache: &RepositoryCache,
    Parameters(params): Parameters<RefreshRepoParams>,
) -> Result<CallToolResult, McpError> {
    let source = parse_source(&params.repo_path)?;
    let strategy = parse_strategy(params.cache_strategy.as_deref())?;
    let branch = params.branch.as_deref().filter(|b| !b.is_empty());

    let status = cache
        .refresh(source.identity(), branch, strategy)
        .map_err(|e| cache_error(&e))?;
    let body = status_json(status, branch, Duration::from_secs(params.wait_secs)).await;
    json_result(&body)
}
