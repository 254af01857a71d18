//! MCP server implementation for repolens.

mod params;
mod tools;

pub use params::*;

use crate::config::DocumentationConfig;
use repolens_cache::RepositoryCache;
use rmcp::handler::server::ServerHandler;
use rmcp::handler::server::tool::{ToolCallContext, ToolRouter};
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Implementation, InitializeResult, ListToolsResult,
    ProtocolVersion, ServerCapabilities,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ErrorData as McpError, tool, tool_router};
use std::sync::Arc;

const INSTRUCTIONS: &str = "Clone repositories with clone_repo, poll get_repo_status until ready, \
then read them with get_repo_file_content, get_repo_structure and get_repo_documentation.";

/// MCP server exposing the repository cache.
#[derive(Clone)]
pub struct RepolensServer {
    tool_router: ToolRouter<Self>,
    cache: Arc<RepositoryCache>,
    documentation: Arc<DocumentationConfig>,
}

#[tool_router]
impl RepolensServer {
    /// Create a new MCP server instance.
    pub fn new(cache: Arc<RepositoryCache>, documentation: DocumentationConfig) -> Self {
        Self {
            tool_router: Self::tool_router(),
            cache,
            documentation: Arc::new(documentation),
        }
    }

    /// Clone a repository into the cache.
    #[tool(
        description = "Clone a repository into the cache (or reuse the cached copy). Returns immediately with status `ready` or `pending`; poll get_repo_status for pending clones"
    )]
    async fn clone_repo(&self, params: Parameters<CloneRepoParams>) -> Result<CallToolResult, McpError> {
        tools::clone_repo::handle_clone_repo(&self.cache, params).await
    }

    /// Refresh a cached repository.
    #[tool(description = "Fetch upstream changes for a cached repository branch in the background")]
    async fn refresh_repo(&self, params: Parameters<RefreshRepoParams>) -> Result<CallToolResult, McpError> {
        tools::refresh_repo::handle_refresh_repo(&self.cache, params).await
    }

    /// Report the status of a repository.
    #[tool(
        description = "Get the cache state of a repository: ready, pending (with the running operation) or error (with the recorded failure)"
    )]
    async fn get_repo_status(&self, params: Parameters<GetRepoStatusParams>) -> Result<CallToolResult, McpError> {
        tools::get_repo_status::handle_get_repo_status(&self.cache, params).await
    }

    /// List cached branches of a repository.
    #[tool(description = "List branches of a cached repository that have a checked-out workspace, with head commits")]
    async fn list_cached_repository_branches(
        &self,
        params: Parameters<RepoUrlParams>,
    ) -> Result<CallToolResult, McpError> {
        tools::list_cached_branches::handle_list_cached_branches(&self.cache, params).await
    }

    /// List branches on the remote.
    #[tool(description = "List branches advertised by the remote repository without cloning it")]
    async fn list_remote_branches(&self, params: Parameters<RepoUrlParams>) -> Result<CallToolResult, McpError> {
        tools::list_remote_branches::handle_list_remote_branches(&self.cache, params).await
    }

    /// List every cached repository.
    #[tool(description = "List all cached repositories with state, branches and size")]
    async fn list_cached_repos(&self) -> Result<CallToolResult, McpError> {
        tools::list_cached_repos::handle_list_cached_repos(&self.cache).await
    }

    /// Summarize the cache.
    #[tool(description = "Report cache capacity, entry counts, total size and eviction pressure")]
    async fn cache_status(&self) -> Result<CallToolResult, McpError> {
        tools::cache_status::handle_cache_status(&self.cache).await
    }

    /// Remove a repository from the cache.
    #[tool(description = "Remove a repository and all of its workspaces from the cache")]
    async fn remove_repo(&self, params: Parameters<RemoveRepoParams>) -> Result<CallToolResult, McpError> {
        tools::remove_repo::handle_remove_repo(&self.cache, params).await
    }

    /// Read a file or list a directory.
    #[tool(
        description = "Read a file or list a directory (non-recursive) from a cached repository branch"
    )]
    async fn get_repo_file_content(
        &self,
        params: Parameters<GetRepoFileContentParams>,
    ) -> Result<CallToolResult, McpError> {
        tools::get_repo_file_content::handle_get_repo_file_content(&self.cache, params).await
    }

    /// Summarize the source layout.
    #[tool(description = "Count analyzable source files per directory, optionally listing them")]
    async fn get_repo_structure(
        &self,
        params: Parameters<GetRepoStructureParams>,
    ) -> Result<CallToolResult, McpError> {
        tools::get_repo_structure::handle_get_repo_structure(&self.cache, params).await
    }

    /// List documentation files.
    #[tool(description = "List documentation files (README, API docs, guides, examples) with category and format")]
    async fn get_repo_documentation(
        &self,
        params: Parameters<GetRepoDocumentationParams>,
    ) -> Result<CallToolResult, McpError> {
        tools::get_repo_documentation::handle_get_repo_documentation(
            &self.cache,
            Arc::clone(&self.documentation),
            params,
        )
        .await
    }
}

impl ServerHandler for RepolensServer {
    fn get_info(&self) -> InitializeResult {
        let capabilities = ServerCapabilities::builder()
            .enable_tools()
            .enable_tool_list_changed()
            .build();

        InitializeResult {
            protocol_version: ProtocolVersion::LATEST,
            capabilities,
            server_info: Implementation {
                name: "repolens".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                title: None,
                website_url: None,
            },
            instructions: Some(INSTRUCTIONS.into()),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.tool_router.list_all(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool_context = ToolCallContext::new(self, request, context);
        self.tool_router.call(tool_context).await
    }
}
