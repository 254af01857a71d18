//! Repository documentation tool implementation.

use super::common::{json_result, parse_source, with_workspace};
use crate::analysis::documentation::{DocumentationReport, collect};
use crate::config::DocumentationConfig;
use crate::mcp::params::GetRepoDocumentationParams;
use repolens_cache::RepositoryCache;
use rmcp::ErrorData as McpError;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::CallToolResult;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct DocumentationResponse {
    documentation: DocumentationReport,
    branch: String,
    head_commit: String,
}

/// List documentation files classified by category and format.
pub async fn handle_get_repo_documentation(
    cache: &RepositoryCache,
    config: Arc<DocumentationConfig>,
    Parameters(params): Parameters<GetRepoDocumentationParams>,
) -> Result<CallToolResult, McpError> {
    let source = parse_source(&params.repo_path)?;
    let (documentation, branch, head_commit) =
        with_workspace(cache, &source, params.branch.as_deref(), move |root| collect(root, &config)).await?;
    json_result(&DocumentationResponse {
        documentation,
        branch,
        head_commit,
    })
}
