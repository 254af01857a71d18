//! One-shot CLI commands against the cache.

use anyhow::{Context, Result, anyhow, bail};
use repolens_cache::{EntryStatus, RepositoryCache};
use repolens_core::{RepoSource, RepositoryEntry};
use serde::Serialize;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;

use crate::Command;

/// Run a non-server command.
pub async fn run(command: Command, cache: &RepositoryCache) -> Result<()> {
    match command {
        Command::Clone { source, branch, wait } => {
            let source = parse_source(&source)?;
            let status = cache.ensure_cached(&source, branch.as_deref(), None)?;
            let entry = settle(cache, status, wait).await?;
            print_entry(&entry);
        }
        Command::Refresh { source, branch, wait } => {
            let source = parse_source(&source)?;
            let status = cache.refresh(source.identity(), branch.as_deref(), None)?;
            let entry = settle(cache, status, wait).await?;
            print_entry(&entry);
        }
        Command::Ls => {
            let mut entries = cache.entries();
            entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
            for entry in &entries {
                println!("{}", format_entry_line(entry));
            }
            let summary = cache.summary();
            println!(
                "{} of {} repositories, {} bytes",
                summary.entries, summary.capacity, summary.total_bytes
            );
            if let Some(pressure) = summary.pressure {
                println!(
                    "over capacity by {}: {} entries in use",
                    pressure.shortfall,
                    pressure.blocked.len()
                );
            }
        }
        Command::Branches { source } => {
            let source = parse_source(&source)?;
            for branch in cache.list_cached_branches(source.identity())? {
                println!(
                    "{}\t{}\t{}\t{}",
                    branch.branch,
                    branch.head_commit,
                    branch.strategy,
                    branch.path.display()
                );
            }
        }
        Command::RemoteBranches { source } => {
            let source = parse_source(&source)?;
            for branch in cache.list_remote_branches(&source).await? {
                println!("{branch}");
            }
        }
        Command::Status { source } => {
            let source = parse_source(&source)?;
            let status = cache.status(source.identity())?;
            let view = StatusView {
                identity: status.identity.to_string(),
                task: status.task.as_ref().map(|task| task.kind().to_string()),
                entry: status.entry,
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Evict { source } => {
            let source = parse_source(&source)?;
            if cache.remove(source.identity()).await? {
                println!("evicted: {}", source.identity());
            } else {
                println!("not cached: {}", source.identity());
            }
        }
        Command::Gc => {
            let report = cache.enforce_capacity().await?;
            for identity in &report.evicted {
                println!("evicted: {identity}");
            }
            for identity in &report.deferred {
                println!("deferred: {identity}");
            }
            if let Some(pressure) = report.pressure {
                println!("still over capacity by {}", pressure.shortfall);
            }
        }
        Command::Serve => bail!("serve is handled by the MCP server"),
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusView {
    identity: String,
    task: Option<String>,
    entry: Option<RepositoryEntry>,
}

fn parse_source(raw: &str) -> Result<RepoSource> {
    RepoSource::parse(raw).with_context(|| format!("invalid repository source: {raw}"))
}

/// Wait for a pending clone or refresh; give up after `wait` seconds or the
/// configured operation timeout.
async fn settle(cache: &RepositoryCache, status: EntryStatus, wait: Option<u64>) -> Result<RepositoryEntry> {
    match status {
        EntryStatus::Ready { entry, .. } => Ok(entry),
        EntryStatus::Pending { handle, .. } => {
            let limit = wait.map_or(cache.config().operation_timeout, Duration::from_secs);
            match handle.wait_timeout(limit).await {
                Some(outcome) => outcome.map_err(|err| anyhow!("{err}")),
                None => {
                    handle.cancel();
                    bail!("{} of {} still running after {limit:?}", handle.kind(), handle.identity())
                }
            }
        }
    }
}

fn print_entry(entry: &RepositoryEntry) {
    println!("{}", format_entry_line(entry));
    for workspace in entry.workspaces.values() {
        println!(
            "  {}\t{}\t{}",
            workspace.branch,
            workspace.head_commit,
            workspace.path.display()
        );
    }
}

fn format_entry_line(entry: &RepositoryEntry) -> String {
    let accessed = entry
        .last_accessed
        .format(&Rfc3339)
        .unwrap_or_else(|_| entry.last_accessed.to_string());
    format!(
        "{}\t{}\t{} bytes\t{}",
        entry.identity, entry.state, entry.size_bytes, accessed
    )
}
