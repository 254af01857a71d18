//! Per-directory counts of source files.

use super::{AnalysisError, extension_of, relative_display, resolve_within, walk_files};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Extensions counted as analyzable source code.
const SOURCE_EXTENSIONS: &[&str] = &[
    "c", "cc", "cpp", "cs", "cxx", "go", "h", "hpp", "java", "js", "jsx", "kt", "kts", "lua", "m",
    "php", "py", "rb", "rs", "scala", "sh", "swift", "ts", "tsx", "vue", "zig",
];

/// Source files found directly inside one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryStats {
    pub path: String,
    pub analyzable_files: usize,
    /// Extension to file count.
    pub extensions: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

/// Result of [`summarize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructureReport {
    pub directories: Vec<DirectoryStats>,
    pub total_analyzable_files: usize,
}

/// Count analyzable files per directory under `root`.
///
/// `directories` limits the walk to those subtrees; `include_files` adds the
/// file names to every directory.
pub fn summarize(root: &Path, directories: &[String], include_files: bool) -> Result<StructureReport, AnalysisError> {
    let canonical_root = root.canonicalize()?;
    let starts = if directories.is_empty() {
        vec![canonical_root.clone()]
    } else {
        directories
            .iter()
            .map(|dir| resolve_within(&canonical_root, dir))
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut by_dir: BTreeMap<String, DirectoryStats> = BTreeMap::new();
    let mut seen = BTreeSet::new();
    for start in &starts {
        for entry in walk_files(start) {
            let Some(ext) = extension_of(entry.path()) else {
                continue;
            };
            if !SOURCE_EXTENSIONS.contains(&ext.as_str()) || !seen.insert(entry.path().to_path_buf()) {
                continue;
            }
            let parent = entry.path().parent().unwrap_or(&canonical_root);
            let dir = relative_display(&canonical_root, parent);
            let stats = by_dir.entry(dir.clone()).or_insert_with(|| DirectoryStats {
                path: dir,
                analyzable_files: 0,
                extensions: BTreeMap::new(),
                files: include_files.then(Vec::new),
            });
            stats.analyzable_files += 1;
            *stats.extensions.entry(ext).or_default() += 1;
            if let Some(files) = stats.files.as_mut() {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }

    let total_analyzable_files = by_dir.values().map(|stats| stats.analyzable_files).sum();
    Ok(StructureReport {
        directories: by_dir.into_values().collect(),
        total_analyzable_files,
    })
}
