//! Filter configuration.
//!
//! Loaded from a TOML file (`--config`, `$LFS_FILTER_CONFIG`, or
//! `<git-dir>/lfs-filter.toml`), then overridden from the environment.

use crate::error::{FilterError, Result};
use crate::lfs::path_filter::PathFilter;
use crate::transfer::{QueueConfig, RetryPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "lfs-filter.toml";

pub const SKIP_SMUDGE_ENV: &str = "GIT_LFS_SKIP_SMUDGE";
pub const REMOTE_ENV: &str = "LFS_FILTER_REMOTE";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    /// Local object store root, `<git-dir>/lfs` when unset
    pub storage_dir: Option<PathBuf>,
    /// Storage directory objects are fetched from
    pub remote: Option<PathBuf>,
    pub concurrent_transfers: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub fetch_include: Vec<String>,
    pub fetch_exclude: Vec<String>,
    pub skip_smudge: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            remote: None,
            concurrent_transfers: 8,
            max_retries: 8,
            retry_delay_ms: 100,
            fetch_include: Vec::new(),
            fetch_exclude: Vec::new(),
            skip_smudge: false,
        }
    }
}

impl FilterConfig {
    /// Load from `explicit` if given, else from the repository's config file
    /// if it exists, else defaults. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>, git_dir: &Path) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = git_dir.join(CONFIG_FILE_NAME);
                if path.is_file() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FilterError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text).map_err(|e| match e {
            FilterError::Config(msg) => FilterError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| FilterError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Some(remote) = std::env::var_os(REMOTE_ENV).filter(|v| !v.is_empty()) {
            self.remote = Some(PathBuf::from(remote));
        }
        if let Ok(value) = std::env::var(SKIP_SMUDGE_ENV) {
            self.skip_smudge = self.skip_smudge || parse_bool_env(&value);
        }
    }

    pub fn storage_dir(&self, git_dir: &Path) -> PathBuf {
        self.storage_dir
            .clone()
            .unwrap_or_else(|| git_dir.join("lfs"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn queue_config(&self, git_dir: &Path) -> QueueConfig {
        QueueConfig {
            concurrent_transfers: self.concurrent_transfers.max(1),
            retry: self.retry_policy(),
            tmp_dir: self.storage_dir(git_dir).join("tmp"),
        }
    }

    pub fn path_filter(&self) -> Result<PathFilter> {
        PathFilter::new(&self.fetch_include, &self.fetch_exclude)
    }
}

/// Git-style boolean: `1`, `true`, `yes` and `on` are true.
pub fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Find the `.git` directory for `start`.
///
/// A `.git` file holding `gitdir: <path>` (worktrees, submodules) is followed.
/// Falls back to `start/.git` when nothing is found.
pub fn resolve_git_dir(start: &Path) -> PathBuf {
    for dir in start.ancestors() {
        let candidate = dir.join(".git");
        if candidate.is_dir() {
            return candidate;
        }
        if candidate.is_file() {
            if let Ok(text) = std::fs::read_to_string(&candidate) {
                if let Some(target) = text.trim().strip_prefix("gitdir:") {
                    let target = Path::new(target.trim());
                    return if target.is_absolute() {
                        target.to_path_buf()
                    } else {
                        dir.join(target)
                    };
                }
            }
        }
    }
    start.join(".git")
}
