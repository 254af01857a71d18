//! Repository status tool implementation.

use super::common::{json_result, parse_source, repo_status_json};
use crate::mcp::params::GetRepoStatusParams;
use repolens_cache::RepositoryCache;
use rmcp::ErrorData as McpError;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::CallToolResult;
use std::time::Duration;

/// Report the state, last failure, workspaces and running job of a repository.
pub async fn handle_get_repo_status(
    cache: &RepositoryCache,
    Parameters(params): Parameters<GetRepoStatusParams>,
) -> Result<CallToolResult, McpError> {
    let source = parse_source(&params.repo_path)?;
    let body = repo_status_json(cache, &source, Duration::from_secs(params.wait_secs)).await?;
    json_result(&body)
}
