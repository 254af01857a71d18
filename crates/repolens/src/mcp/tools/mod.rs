//! MCP tool implementations.

pub mod cache_status;
pub mod clone_repo;
pub mod common;
pub mod get_repo_documentation;
pub mod get_repo_file_content;
pub mod get_repo_status;
pub mod get_repo_structure;
pub mod list_cached_branches;
pub mod list_cached_repos;
pub mod list_remote_branches;
pub mod refresh_repo;
pub mod remove_repo;
