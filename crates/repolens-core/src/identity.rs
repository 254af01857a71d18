//! Canonical identities for repository sources.
//!
//! Every source a caller hands us (an HTTPS URL, an scp-style SSH address, a
//! `file://` URL or a plain filesystem path) is reduced to a [`RepoIdentity`].
//! Two spellings of the same repository map to the same identity, and parsing
//! an identity string again yields the identity unchanged.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory (relative to the cache root) that holds local-path sources.
pub const LOCAL_SOURCES_DIR: &str = "local";

/// Errors raised while canonicalizing a repository source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The source string was empty.
    #[error("repository source must not be empty")]
    Empty,

    /// The URL scheme is not one we can clone from.
    #[error("unsupported repository URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The URL has no host component.
    #[error("repository URL has no host: {0}")]
    MissingHost(String),

    /// The URL has no repository path component.
    #[error("repository URL has no path: {0}")]
    MissingPath(String),

    /// A local path could not be made absolute.
    #[error("invalid local repository path {path}: {reason}")]
    InvalidPath {
        /// Path as supplied by the caller.
        path: String,
        /// Underlying reason.
        reason: String,
    },
}

/// Canonical key of a cached repository.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoIdentity(String);

impl RepoIdentity {
    /// Borrow the canonical string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a repository comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceKind {
    /// A network remote.
    Remote {
        /// Lower-cased host (with port, if any).
        host: String,
        /// Repository path on the host without `.git`.
        path: String,
    },
    /// A repository on the local filesystem.
    Local {
        /// Absolute path of the repository.
        path: PathBuf,
    },
}

/// A parsed repository source: what to clone from and how it is keyed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RepoSource {
    location: String,
    identity: RepoIdentity,
    kind: SourceKind,
}

impl RepoSource {
    /// Parse and canonicalize a user-supplied source.
    ///
    /// # Errors
    /// Returns an [`IdentityError`] when the source is empty, uses an unsupported
    /// scheme, or lacks a host or repository path.
    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }

        if let Some((scheme, rest)) = trimmed.split_once("://") {
            let scheme = scheme.to_ascii_lowercase();
            return match scheme.as_str() {
                "file" => Self::local(Path::new(rest)),
                "http" | "https" | "ssh" | "git" => Self::remote(trimmed, &scheme, rest),
                "git+ssh" | "ssh+git" => Self::remote(trimmed, "ssh", rest),
                other => Err(IdentityError::UnsupportedScheme(other.to_owned())),
            };
        }

        if let Some((authority, path)) = scp_like(trimmed) {
            return Self::remote_parts(trimmed, "ssh", authority, path);
        }

        Self::local(Path::new(trimmed))
    }

    fn remote(raw: &str, scheme: &str, rest: &str) -> Result<Self, IdentityError> {
        let Some((authority, path)) = rest.split_once('/') else {
            return Err(IdentityError::MissingPath(raw.to_owned()));
        };
        Self::remote_parts(raw, scheme, authority, path)
    }

    fn remote_parts(raw: &str, scheme: &str, authority: &str, path: &str) -> Result<Self, IdentityError> {
        // Credentials never become part of the identity.
        let host = authority
            .rsplit_once('@')
            .map_or(authority, |(_, host)| host)
            .to_ascii_lowercase();
        if host.is_empty() {
            return Err(IdentityError::MissingHost(raw.to_owned()));
        }

        let path = path.trim_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path).trim_end_matches('/');
        if path.is_empty() {
            return Err(IdentityError::MissingPath(raw.to_owned()));
        }

        Ok(Self {
            location: raw.to_owned(),
            identity: RepoIdentity(format!("{scheme}://{host}/{path}")),
            kind: SourceKind::Remote {
                host,
                path: path.to_owned(),
            },
        })
    }

    fn local(path: &Path) -> Result<Self, IdentityError> {
        let invalid = |reason: String| IdentityError::InvalidPath {
            path: path.display().to_string(),
            reason,
        };
        let absolute = if path.exists() {
            fs::canonicalize(path).map_err(|err| invalid(err.to_string()))?
        } else {
            std::path::absolute(path).map_err(|err| invalid(err.to_string()))?
        };

        Ok(Self {
            location: absolute.display().to_string(),
            identity: RepoIdentity(format!("file://{}", absolute.display())),
            kind: SourceKind::Local { path: absolute },
        })
    }

    /// Location handed to the version-control collaborator for cloning.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Canonical identity.
    #[must_use]
    pub const fn identity(&self) -> &RepoIdentity {
        &self.identity
    }

    /// Source classification.
    #[must_use]
    pub const fn kind(&self) -> &SourceKind {
        &self.kind
    }

    /// Directory owning this repository, relative to the cache root.
    ///
    /// Remotes land under `<host>/<org>/<repo>-<hash>`, local paths under
    /// `local/<name>-<hash>`. The hash suffix keeps two identities that
    /// sanitize to the same segments from sharing a root.
    #[must_use]
    pub fn root_dir(&self) -> PathBuf {
        let suffix = short_hash(self.identity.as_str());
        match &self.kind {
            SourceKind::Remote { host, path } => {
                let mut dir = PathBuf::from(sanitize_segment(host));
                let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if let Some((last, parents)) = segments.split_last() {
                    for segment in parents {
                        dir.push(sanitize_segment(segment));
                    }
                    dir.push(format!("{}-{suffix}", sanitize_segment(last)));
                }
                dir
            }
            SourceKind::Local { path } => {
                let name = path
                    .file_name()
                    .map_or_else(|| "root".to_owned(), |name| name.to_string_lossy().into_owned());
                PathBuf::from(LOCAL_SOURCES_DIR).join(format!("{}-{suffix}", sanitize_segment(&name)))
            }
        }
    }

    /// Absolute root directory under `cache_root`.
    #[must_use]
    pub fn root_path(&self, cache_root: &Path) -> PathBuf {
        cache_root.join(self.root_dir())
    }
}

fn scp_like(input: &str) -> Option<(&str, &str)> {
    let (head, tail) = input.split_once(':')?;
    // `C:\repo` is a drive letter, `./a:b` is a path.
    if head.len() <= 1 || head.contains('/') || head.contains('\\') || tail.starts_with("//") {
        return None;
    }
    Some((head, tail))
}

/// Replace anything that is not safe as a single path segment.
#[must_use]
pub fn sanitize_segment(segment: &str) -> String {
    let mut out: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.starts_with('.') {
        out.replace_range(0..1, "_");
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// First eight hex digits of the SHA-256 of `value`.
#[must_use]
pub fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..4])
}
