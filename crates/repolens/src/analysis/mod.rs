//! Read-only analysis of a leased workspace.
//!
//! Every function here takes the workspace directory and never writes to it.
//! Callers hold a [`repolens_cache::WorkspaceLease`] for the duration.

pub mod documentation;
pub mod file_content;
pub mod structure;

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Directories never descended into.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".idea",
    ".vscode",
    ".vs",
    ".cache",
    ".tmp",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    "tmp",
    "temp",
];

/// Errors raised while reading a workspace.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("path `{0}` does not exist in the repository")]
    NotFound(String),
    #[error("path `{0}` escapes the repository")]
    OutsideWorkspace(String),
    #[error("file `{0}` is not valid UTF-8 text")]
    NotText(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl AnalysisError {
    /// Whether the caller asked for something that cannot be served.
    pub const fn is_caller_error(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Resolve `relative` inside `root`, refusing anything that leaves it.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, AnalysisError> {
    let trimmed = relative.trim();
    let relative = Path::new(if trimmed.is_empty() { "." } else { trimmed });
    if relative
        .components()
        .any(|component| matches!(component, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(AnalysisError::OutsideWorkspace(relative.display().to_string()));
    }
    let candidate = root.join(relative);
    if !candidate.exists() {
        return Err(AnalysisError::NotFound(relative.display().to_string()));
    }
    // Symlinks inside the tree may still point outside it.
    let canonical_root = root.canonicalize()?;
    let canonical = candidate.canonicalize()?;
    if !canonical.starts_with(&canonical_root) {
        return Err(AnalysisError::OutsideWorkspace(relative.display().to_string()));
    }
    Ok(canonical)
}

/// Path of `path` relative to `root`, `/`-separated.
pub fn relative_display(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let joined = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() { ".".to_owned() } else { joined }
}

/// Regular files under `root`, skipping ignored directories.
pub fn walk_files(root: &Path) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_ignored_dir(entry))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
}

fn is_ignored_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

/// Lower-cased extension without the dot.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}
