//! Shared helpers for MCP tool implementations.

use crate::analysis::AnalysisError;
use repolens_cache::{EntryStatus, RepositoryCache, TaskHandle, TaskOutcome};
use repolens_core::{BranchStrategy, CacheError, RepoSource, RepositoryEntry, WorkspaceKey};
use rmcp::ErrorData as McpError;
use rmcp::model::{CallToolResult, Content};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;

/// Parse a repository URL or path.
pub fn parse_source(raw: &str) -> Result<RepoSource, McpError> {
    RepoSource::parse(raw).map_err(|e| McpError::invalid_params(format!("Invalid repository: {e}"), None))
}

/// Parse an optional strategy name.
pub fn parse_strategy(raw: Option<&str>) -> Result<Option<BranchStrategy>, McpError> {
    raw.filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .transpose()
        .map_err(|e| McpError::invalid_params(format!("{e}"), None))
}

/// Map a cache error onto the protocol error space.
pub fn cache_error(err: &CacheError) -> McpError {
    let data = Some(json!({
        "retryable": err.is_retryable(),
        "kind": err.failure_kind(),
    }));
    match err {
        CacheError::NotCached(_)
        | CacheError::NotReady { .. }
        | CacheError::BranchNotFound { .. }
        | CacheError::InvalidSource(_) => McpError::invalid_params(err.to_string(), data),
        _ => McpError::internal_error(err.to_string(), data),
    }
}

/// Map an analysis error onto the protocol error space.
pub fn analysis_error(err: &AnalysisError) -> McpError {
    if err.is_caller_error() {
        McpError::invalid_params(err.to_string(), None)
    } else {
        McpError::internal_error(err.to_string(), None)
    }
}

/// Pretty JSON as a successful tool result.
pub fn json_result<T: Serialize + ?Sized>(value: &T) -> Result<CallToolResult, McpError> {
    let json_str =
        serde_json::to_string_pretty(value).map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(json_str)]))
}

fn entry_json(entry: &RepositoryEntry, branch: Option<&str>) -> Value {
    let workspace = branch
        .and_then(|b| entry.find_workspace(b))
        .or_else(|| entry.workspaces.get_key_value(&WorkspaceKey::Shared))
        .or_else(|| entry.workspaces.iter().next())
        .map(|(_, ws)| ws);
    json!({
        "identity": entry.identity,
        "state": entry.state,
        "default_branch": entry.default_branch,
        "branch": workspace.map(|ws| &ws.branch),
        "head_commit": workspace.map(|ws| &ws.head_commit),
        "path": workspace.map(|ws| &ws.path),
        "strategy": workspace.map(|ws| ws.strategy),
        "size_bytes": entry.size_bytes,
        "last_accessed": entry.last_accessed.format(&Rfc3339).ok(),
        "failure": entry.failure,
    })
}

fn task_json(handle: &TaskHandle) -> Value {
    json!({
        "id": handle.id().to_string(),
        "operation": handle.kind(),
        "finished": handle.is_finished(),
        "cancelled": handle.is_cancelled(),
    })
}

/// Body for a finished background job.
pub fn outcome_json(outcome: &TaskOutcome, branch: Option<&str>) -> Value {
    match outcome {
        Ok(entry) => {
            let mut body = entry_json(entry, branch);
            body["status"] = json!("ready");
            body
        }
        Err(err) => json!({
            "status": "error",
            "error": err.to_string(),
            "kind": err.failure_kind(),
            "retryable": err.is_retryable(),
        }),
    }
}

/// Body for an [`EntryStatus`], waiting up to `wait` for a pending job.
pub async fn status_json(status: EntryStatus, branch: Option<&str>, wait: Duration) -> Value {
    match status {
        EntryStatus::Ready { entry, workspace } => {
            let mut body = entry_json(&entry, Some(&workspace.branch));
            body["status"] = json!("ready");
            body
        }
        EntryStatus::Pending {
            identity,
            handle,
            previous_failure,
        } => {
            if !wait.is_zero()
                && let Some(outcome) = handle.wait_timeout(wait).await
            {
                return outcome_json(&outcome, branch);
            }
            json!({
                "status": "pending",
                "identity": identity,
                "task": task_json(&handle),
                "previous_failure": previous_failure,
                "message": "operation running in the background; poll get_repo_status",
            })
        }
    }
}

/// Body for `get_repo_status`.
pub async fn repo_status_json(cache: &RepositoryCache, source: &RepoSource, wait: Duration) -> Result<Value, McpError> {
    let status = cache.status(source.identity()).map_err(|e| cache_error(&e))?;
    if let Some(task) = status.task.as_ref()
        && !wait.is_zero()
    {
        // The finished entry is re-read below.
        let _ = task.wait_timeout(wait).await;
    }
    let status = cache.status(source.identity()).map_err(|e| cache_error(&e))?;
    let branches = cache.list_cached_branches(source.identity()).unwrap_or_default();
    let mut body = status
        .entry
        .as_ref()
        .map_or_else(|| json!({ "identity": status.identity }), |entry| entry_json(entry, None));
    body["status"] = json!(match (&status.task, &status.entry) {
        (Some(_), _) => "pending",
        (None, Some(entry)) if entry.workspaces.is_empty() => "error",
        (None, Some(_)) => "ready",
        (None, None) => "unknown",
    });
    body["task"] = status.task.as_ref().map_or(Value::Null, task_json);
    body["workspaces"] = json!(branches);
    Ok(body)
}

/// Lease a workspace and run `action` on its directory off the async runtime.
///
/// The lease is held until `action` returns.
pub async fn with_workspace<F, R>(
    cache: &RepositoryCache,
    source: &RepoSource,
    branch: Option<&str>,
    action: F,
) -> Result<(R, String, String), McpError>
where
    F: FnOnce(&Path) -> Result<R, AnalysisError> + Send + 'static,
    R: Send + 'static,
{
    let lease = cache
        .lease_workspace(source.identity(), branch)
        .await
        .map_err(|e| cache_error(&e))?;
    let branch = lease.branch().to_owned();
    let head = lease.head_commit().to_owned();
    let result = tokio::task::spawn_blocking(move || {
        let result = action(lease.path());
        drop(lease);
        result
    })
    .await
    .map_err(|e| McpError::internal_error(format!("Task join error: {e}"), None))?
    .map_err(|e| analysis_error(&e))?;
    Ok((result, branch, head))
}
