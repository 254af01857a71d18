//! Repository structure tool implementation.

use super::common::{json_result, parse_source, with_workspace};
use crate::analysis::structure::{StructureReport, summarize};
use crate::mcp::params::GetRepoStructureParams;
use repolens_cache::RepositoryCache;
use rmcp::ErrorData as McpError;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::CallToolResult;
use serde::Serialize;

#[derive(Serialize)]
struct StructureResponse {
    #[serde(flatten)]
    report: StructureReport,
    branch: String,
    head_commit: String,
}

/// Count analyzable source files per directory.
pub async fn handle_get_repo_structure(
    cache: &RepositoryCache,
    Parameters(params): Parameters<GetRepoStructureParams>,
) -> Result<CallToolResult, McpError> {
    let source = parse_source(&params.repo_path)?;
    let GetRepoStructureParams {
        directories,
        include_files,
        branch,
        ..
    } = params;
    let (report, branch, head_commit) = with_workspace(cache, &source, branch.as_deref(), move |root| {
        summarize(root, &directories, include_files)
    })
    .await?;
    json_result(&StructureResponse {
        report,
        branch,
        head_commit,
    })
}
