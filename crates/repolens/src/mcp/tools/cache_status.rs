//! Cache status tool implementation.

use super::common::json_result;
use repolens_cache::RepositoryCache;
use rmcp::ErrorData as McpError;
use rmcp::model::CallToolResult;

/// Report entry counts, capacity, total size and cache pressure.
#[allow(clippy::unused_async)]
pub async fn handle_cache_status(cache: &RepositoryCache) -> Result<CallToolResult, McpError> {
    json_result(&cache.summary())
}
