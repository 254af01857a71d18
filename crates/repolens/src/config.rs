//! Configuration loaded from `config.toml`.

use anyhow::{Context, Result, anyhow, bail};
use repolens_cache::{CacheConfig, OrphanPolicy};
use repolens_core::BranchStrategy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "repolens";
const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub documentation: DocumentationConfig,
}

impl AppConfig {
    /// Load from `explicit`, or from the user configuration directory.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file named explicitly is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_path(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_path(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parse and validate the file at `path`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command line overrides on top of the file.
    pub fn with_overrides(
        mut self,
        cache_dir: Option<PathBuf>,
        max_cached_repos: Option<usize>,
        strategy: Option<BranchStrategy>,
    ) -> Result<Self> {
        if let Some(dir) = cache_dir {
            self.cache.dir = Some(dir);
        }
        if let Some(max) = max_cached_repos {
            self.cache.max_cached_repos = max;
        }
        if let Some(strategy) = strategy {
            self.cache.default_strategy = strategy;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.documentation.validate()
    }
}

/// `[cache]` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Cache root; defaults to `<user cache dir>/repolens`.
    pub dir: Option<PathBuf>,
    pub max_cached_repos: usize,
    pub default_strategy: BranchStrategy,
    pub workers: usize,
    pub lock_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub orphan_policy: OrphanPolicy,
}

impl Default for CacheSection {
    fn default() -> Self {
        let defaults = CacheConfig::new(PathBuf::new());
        Self {
            dir: None,
            max_cached_repos: defaults.max_cached_repos,
            default_strategy: defaults.default_strategy,
            workers: defaults.workers,
            lock_timeout_secs: defaults.lock_timeout.as_secs(),
            operation_timeout_secs: defaults.operation_timeout.as_secs(),
            orphan_policy: defaults.orphan_policy,
        }
    }
}

impl CacheSection {
    fn validate(&self) -> Result<()> {
        if self.max_cached_repos == 0 {
            bail!("cache.max_cached_repos must be at least 1");
        }
        if self.workers == 0 {
            bail!("cache.workers must be at least 1");
        }
        if self.lock_timeout_secs == 0 || self.operation_timeout_secs == 0 {
            bail!("cache timeouts must be greater than zero");
        }
        Ok(())
    }

    /// Resolved cache root.
    pub fn root(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::cache_dir()
                .map(|dir| dir.join(APP_DIR))
                .ok_or_else(|| anyhow!("could not determine the user cache directory; set cache.dir")),
        }
    }

    /// Settings for [`repolens_cache::RepositoryCache::open`].
    pub fn to_cache_config(&self) -> Result<CacheConfig> {
        let mut config = CacheConfig::new(self.root()?);
        config.max_cached_repos = self.max_cached_repos;
        config.default_strategy = self.default_strategy;
        config.workers = self.workers;
        config.lock_timeout = Duration::from_secs(self.lock_timeout_secs);
        config.operation_timeout = Duration::from_secs(self.operation_timeout_secs);
        config.orphan_policy = self.orphan_policy;
        Ok(config)
    }
}

/// `[documentation]` block: which files count as documentation and how they
/// are classified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocumentationConfig {
    /// Extensions (with leading dot) treated as documentation.
    pub include_extensions: Vec<String>,
    /// Extension to format name.
    pub format_mapping: BTreeMap<String, String>,
    /// Category to path substrings; the first matching category wins.
    pub category_patterns: BTreeMap<String, Vec<String>>,
}

impl Default for DocumentationConfig {
    fn default() -> Self {
        let include_extensions = [".md", ".markdown", ".rst", ".txt", ".adoc", ".ipynb"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        let format_mapping = [
            (".md", "markdown"),
            (".markdown", "markdown"),
            (".rst", "restructuredtext"),
            (".txt", "plaintext"),
            (".adoc", "asciidoc"),
            (".ipynb", "jupyter"),
        ]
        .into_iter()
        .map(|(ext, format)| (ext.to_owned(), format.to_owned()))
        .collect();
        let category_patterns = [
            ("readme", &["readme"][..]),
            ("api", &["api"][..]),
            ("documentation", &["docs", "documentation"][..]),
            ("examples", &["examples", "sample"][..]),
        ]
        .into_iter()
        .map(|(category, patterns)| {
            (
                category.to_owned(),
                patterns.iter().map(|pattern| (*pattern).to_owned()).collect(),
            )
        })
        .collect();
        Self {
            include_extensions,
            format_mapping,
            category_patterns,
        }
    }
}

impl DocumentationConfig {
    fn validate(&self) -> Result<()> {
        let undotted = self
            .include_extensions
            .iter()
            .chain(self.format_mapping.keys())
            .find(|ext| !ext.starts_with('.') || ext.len() < 2);
        if let Some(ext) = undotted {
            bail!("documentation extension `{ext}` must start with a dot");
        }
        Ok(())
    }
}

/// `<user config dir>/repolens/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}
