//! Filter-process mode - runs when Git invokes `lfs-filter filter-process`
//!
//! Git owns both ends of stdio: requests arrive on stdin and responses go to
//! stdout, so nothing else may write there. Logs and the end-of-session
//! summary go to stderr.

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{self, BufReader, BufWriter};

use crate::config::FilterConfig;
use crate::filter::{serve, SessionOptions};
use crate::lfs::LocalStore;
use crate::transfer::{DirectorySource, SharedSource, UnconfiguredSource};

pub const NOT_A_FILTER_MESSAGE: &str = "This command should be run by the Git filter process";

/// Invocation details resolved from the command line.
#[derive(Debug, Clone)]
pub struct FilterProcessArgs {
    pub git_dir: PathBuf,
    pub config: Option<PathBuf>,
    pub remote: Option<PathBuf>,
    pub skip: bool,
}

/// Build session options from config and flags.
pub fn session_options(args: &FilterProcessArgs) -> Result<SessionOptions> {
    let config = FilterConfig::load(args.config.as_deref(), &args.git_dir)?;
    options_from_config(&config, args)
}

fn options_from_config(config: &FilterConfig, args: &FilterProcessArgs) -> Result<SessionOptions> {
    let remote = args.remote.clone().or_else(|| config.remote.clone());
    let source: SharedSource = match remote {
        Some(root) => {
            tracing::debug!(remote = %root.display(), "fetching from directory remote");
            Arc::new(DirectorySource::new(root))
        }
        None => Arc::new(UnconfiguredSource),
    };

    Ok(SessionOptions {
        store: LocalStore::new(config.storage_dir(&args.git_dir)),
        source,
        skip: args.skip || config.skip_smudge,
        filter: config.path_filter()?,
        queue: config.queue_config(&args.git_dir),
    })
}

/// Main filter-process entry point
pub async fn run_filter_process(args: FilterProcessArgs) -> Result<()> {
    if std::io::stdin().is_terminal() {
        anyhow::bail!(NOT_A_FILTER_MESSAGE);
    }

    let options = session_options(&args)?;
    ensure_storage(options.store.root()).await?;

    let stdin = BufReader::new(io::stdin());
    let stdout = BufWriter::new(io::stdout());

    let diagnostics = serve(stdin, stdout, options)
        .await
        .context("filter process failed")?;

    diagnostics
        .report(std::io::stderr().lock())
        .context("failed to write summary")?;
    Ok(())
}

async fn ensure_storage(root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("cannot create LFS storage at {}", root.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(git_dir: &Path) -> FilterProcessArgs {
        FilterProcessArgs {
            git_dir: git_dir.to_path_buf(),
            config: None,
            remote: None,
            skip: false,
        }
    }

    #[test]
    fn test_options_from_defaults() {
        let config = FilterConfig::default();
        let options = options_from_config(&config, &args(Path::new("/repo/.git"))).unwrap();
        assert_eq!(options.store.root(), Path::new("/repo/.git/lfs"));
        assert_eq!(options.queue.tmp_dir, PathBuf::from("/repo/.git/lfs/tmp"));
        assert!(!options.skip);
    }

    #[test]
    fn test_flag_and_config_skip_combine() {
        let config = FilterConfig {
            skip_smudge: true,
            ..FilterConfig::default()
        };
        let options = options_from_config(&config, &args(Path::new("/g"))).unwrap();
        assert!(options.skip);

        let mut flagged = args(Path::new("/g"));
        flagged.skip = true;
        let options = options_from_config(&FilterConfig::default(), &flagged).unwrap();
        assert!(options.skip);
    }

    #[test]
    fn test_bad_filter_pattern_is_reported() {
        let config = FilterConfig {
            fetch_include: vec!["[".to_string()],
            ..FilterConfig::default()
        };
        assert!(options_from_config(&config, &args(Path::new("/g"))).is_err());
    }
}
