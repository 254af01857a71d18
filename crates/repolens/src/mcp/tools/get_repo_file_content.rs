//! File content tool implementation.

use super::common::{json_result, parse_source, with_workspace};
use crate::analysis::file_content::{Resource, read_resource};
use crate::mcp::params::GetRepoFileContentParams;
use repolens_cache::RepositoryCache;
use rmcp::ErrorData as McpError;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::CallToolResult;
use serde::Serialize;

const DEFAULT_MAX_BYTES: usize = 512 * 1024;

#[derive(Serialize)]
struct FileContentResponse {
    #[serde(flatten)]
    resource: Resource,
    branch: String,
    head_commit: String,
}

/// Return a file body or a non-recursive directory listing.
pub async fn handle_get_repo_file_content(
    cache: &RepositoryCache,
    Parameters(params): Parameters<GetRepoFileContentParams>,
) -> Result<CallToolResult, McpError> {
    let source = parse_source(&params.repo_path)?;
    let max_bytes = params.max_bytes.unwrap_or(DEFAULT_MAX_BYTES);
    let resource_path = params.resource_path;
    let (resource, branch, head_commit) = with_workspace(cache, &source, params.branch.as_deref(), move |root| {
        read_resource(root, resource_path.as_deref(), max_bytes)
    })
    .await?;
    json_result(&FileContentResponse {
        resource,
        branch,
        head_commit,
    })
}
