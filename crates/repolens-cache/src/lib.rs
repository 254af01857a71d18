//! Repository cache for repolens.
//!
//! This crate keeps cloned repositories on disk under a bounded, persistent
//! index: cross-process locks, background clone and refresh jobs, LRU
//! eviction, and the shared and per-branch workspace layouts.

pub mod cache;
pub mod config;
pub mod eviction;
pub mod fs_util;
pub mod index;
pub mod lock;
pub mod orchestrator;
pub mod reconcile;
pub mod strategy;

// Re-exports for convenience
pub use cache::{
    CacheSummary, CachedBranch, EntryStatus, RepoStatus, RepositoryCache, StartupReport,
    WorkspaceLease,
};
pub use config::CacheConfig;
pub use eviction::{CachePressure, EvictionPlan, EvictionPolicy, EvictionReport, Evictor};
pub use index::{CacheIndex, LoadReport, ReaderGuard};
pub use lock::{LockCoordinator, LockGuard, LockMode, LockScope};
pub use orchestrator::{CloneOrchestrator, TaskHandle, TaskOutcome};
pub use reconcile::{OrphanPolicy, ReconcileReport, UnknownOrphanPolicy};
pub use strategy::WorkspaceAction;
