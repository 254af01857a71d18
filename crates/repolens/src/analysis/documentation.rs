//! Documentation discovery and classification.

use super::{AnalysisError, relative_display, walk_files};
use crate::config::DocumentationConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

const FALLBACK_CATEGORY: &str = "other";
const FALLBACK_FORMAT: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocFile {
    pub path: String,
    pub category: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocDirectory {
    pub path: String,
    pub doc_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocStats {
    pub total_files: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_format: BTreeMap<String, usize>,
}

/// Documentation found in a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentationReport {
    pub files: Vec<DocFile>,
    pub directories: Vec<DocDirectory>,
    pub stats: DocStats,
}

/// Collect every file whose extension `config` lists as documentation.
pub fn collect(root: &Path, config: &DocumentationConfig) -> Result<DocumentationReport, AnalysisError> {
    let canonical_root = root.canonicalize()?;
    let mut files = Vec::new();
    let mut per_dir: BTreeMap<String, usize> = BTreeMap::new();
    let mut stats = DocStats::default();

    for entry in walk_files(&canonical_root) {
        let Some(ext) = dotted_extension(entry.path()) else {
            continue;
        };
        if !config
            .include_extensions
            .iter()
            .any(|included| included.eq_ignore_ascii_case(&ext))
        {
            continue;
        }
        let path = relative_display(&canonical_root, entry.path());
        let category = categorize(&path, config);
        let format = config
            .format_mapping
            .get(&ext)
            .cloned()
            .unwrap_or_else(|| FALLBACK_FORMAT.to_owned());

        let parent = entry.path().parent().unwrap_or(&canonical_root);
        *per_dir.entry(relative_display(&canonical_root, parent)).or_default() += 1;
        *stats.by_category.entry(category.clone()).or_default() += 1;
        *stats.by_format.entry(format.clone()).or_default() += 1;
        files.push(DocFile { path, category, format });
    }

    stats.total_files = files.len();
    Ok(DocumentationReport {
        files,
        directories: per_dir
            .into_iter()
            .map(|(path, doc_count)| DocDirectory { path, doc_count })
            .collect(),
        stats,
    })
}

/// First category (in name order) with a pattern contained in the path.
fn categorize(path: &str, config: &DocumentationConfig) -> String {
    let lowered = path.to_lowercase();
    config
        .category_patterns
        .iter()
        .find(|(_, patterns)| {
            patterns
                .iter()
                .any(|pattern| lowered.contains(&pattern.to_lowercase()))
        })
        .map_or_else(|| FALLBACK_CATEGORY.to_owned(), |(category, _)| category.clone())
}

fn dotted_extension(path: &Path) -> Option<String> {
    super::extension_of(path).map(|ext| format!(".{ext}"))
}
