//! CLI entry point for repolens.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

use config::AppConfig;
use repolens_cache::RepositoryCache;
use repolens_core::BranchStrategy;
use repolens_git::GitBackend;
use rmcp::ServiceExt;

mod analysis;
mod commands;
mod config;
mod mcp;

/// Repository cache and MCP server for code understanding tools.
#[derive(Parser, Debug)]
#[command(
    name = "repolens",
    version,
    about = "repolens: cached git checkouts served to AI tools over MCP"
)]
struct Cli {
    /// Configuration file (defaults to <config dir>/repolens/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache root directory.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Maximum number of cached repositories.
    #[arg(long, global = true)]
    max_cached_repos: Option<usize>,

    /// Default workspace strategy: `shared` or `per-branch`.
    #[arg(long, global = true)]
    strategy: Option<BranchStrategy>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve MCP over stdio.
    Serve,

    /// Clone a repository into the cache.
    Clone {
        source: String,
        #[arg(long)]
        branch: Option<String>,
        /// Seconds to wait (defaults to the operation timeout).
        #[arg(long)]
        wait: Option<u64>,
    },

    /// Fetch upstream changes for a cached repository.
    Refresh {
        source: String,
        #[arg(long)]
        branch: Option<String>,
        /// Seconds to wait (defaults to the operation timeout).
        #[arg(long)]
        wait: Option<u64>,
    },

    /// List cached repositories.
    Ls,

    /// List branches of a cached repository that have a workspace.
    Branches { source: String },

    /// List branches advertised by a remote.
    RemoteBranches { source: String },

    /// Show the cache entry of a repository.
    Status { source: String },

    /// Remove a repository from the cache.
    Evict { source: String },

    /// Evict least recently used repositories until the cache fits its capacity.
    Gc,
}

fn main() -> Result<()> {
    let Cli {
        config,
        cache_dir,
        max_cached_repos,
        strategy,
        cmd,
    } = Cli::parse();

    install_tracing();

    let config = AppConfig::load(config.as_deref())?.with_overrides(cache_dir, max_cached_repos, strategy)?;
    tokio::runtime::Runtime::new()?.block_on(execute_command(config, cmd))
}

async fn execute_command(config: AppConfig, command: Command) -> Result<()> {
    let cache = Arc::new(RepositoryCache::open(
        config.cache.to_cache_config()?,
        Arc::new(GitBackend::new()),
    )?);

    let result = match command {
        Command::Serve => serve(Arc::clone(&cache), config.documentation).await,
        other => commands::run(other, &cache).await,
    };
    cache.shutdown().await?;
    result
}

async fn serve(cache: Arc<RepositoryCache>, documentation: config::DocumentationConfig) -> Result<()> {
    let server = mcp::RepolensServer::new(cache, documentation);
    let transport = (tokio::io::stdin(), tokio::io::stdout());
    let server = server
        .serve(transport)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    server
        .waiting()
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("{e:?}"))
}

fn install_tracing() {
    // RUST_LOG is honoured; INFO by default. stdout carries the MCP transport.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .compact()
        .try_init();
}
