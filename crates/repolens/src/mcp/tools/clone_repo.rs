//! Clone repository tool implementation.

use super::common::{cache_error, json_result, parse_source, parse_strategy, status_json};
use crate::mcp::params::CloneRepoParams;
use repolens_cache::RepositoryCache;
use rmcp::ErrorData as McpError;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::CallToolResult;
use std::time::Duration;
use tracing::info;

/// Make a repository available in the cache, starting a clone if needed.
pub async fn handle_clone_repo(
    cache: &RepositoryCache,
    Parameters(params): Parameters<CloneRepoParams>,
) -> Result<CallToolResult, McpError> {
    let source = parse_source(&params.url)?;
    let strategy = parse_strategy(params.cache_strategy.as_deref())?;
    let branch = params.branch.as_deref().filter(|b| !b.is_empty());

    info!(identity = %source.identity(), branch = ?branch, "clone_repo");
    let status = cache
        .ensure_cached(&source, branch, strategy)
        .map_err(|e| cache_error(&e))?;
    let body = status_json(status, branch, Duration::from_secs(params.wait_secs)).await;
    json_result(&body)
}
