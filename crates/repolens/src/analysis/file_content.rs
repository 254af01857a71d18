//! File bodies and directory listings.

use super::{AnalysisError, relative_display, resolve_within};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// A file or a non-recursive directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    File {
        path: String,
        content: String,
        size_bytes: u64,
        /// Set when `content` was cut at the size limit.
        truncated: bool,
    },
    Directory {
        path: String,
        /// Immediate children; directories carry a trailing `/`.
        contents: Vec<String>,
    },
}

/// Read `resource` (default: the workspace root) from `root`.
///
/// File bodies longer than `max_bytes` are cut at the nearest character
/// boundary below the limit.
pub fn read_resource(root: &Path, resource: Option<&str>, max_bytes: usize) -> Result<Resource, AnalysisError> {
    let requested = resource.unwrap_or(".");
    let path = resolve_within(root, requested)?;
    let canonical_root = root.canonicalize()?;
    let display = relative_display(&canonical_root, &path);

    if path.is_dir() {
        let mut contents = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == ".git" {
                continue;
            }
            if entry.file_type()?.is_dir() {
                contents.push(format!("{name}/"));
            } else {
                contents.push(name);
            }
        }
        contents.sort();
        return Ok(Resource::Directory {
            path: display,
            contents,
        });
    }

    let bytes = fs::read(&path)?;
    let size_bytes = bytes.len() as u64;
    let mut content = String::from_utf8(bytes).map_err(|_| AnalysisError::NotText(display.clone()))?;
    let truncated = content.len() > max_bytes;
    if truncated {
        let mut cut = max_bytes;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
    }
    Ok(Resource::File {
        path: display,
        content,
        size_bytes,
        truncated,
    })
}
