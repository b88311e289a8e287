//! Where objects come from, and how a single object is downloaded.

use crate::error::{FilterError, Result};
use crate::lfs::pointer::Oid;
use crate::lfs::store::{hash_file, new_temp_path, object_matches, LocalStore};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Write the object's bytes to `dest`. `dest` exists and is empty.
    async fn fetch(&self, oid: &Oid, size: u64, dest: &Path) -> Result<()>;
}

/// Another LFS storage directory used as the remote.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    remote: LocalStore,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            remote: LocalStore::new(root),
        }
    }
}

#[async_trait]
impl ObjectSource for DirectorySource {
    async fn fetch(&self, oid: &Oid, _size: u64, dest: &Path) -> Result<()> {
        let src = self.remote.object_path(oid);
        fs::copy(&src, dest).await?;
        Ok(())
    }
}

/// Used when no remote is configured; every fetch fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredSource;

#[async_trait]
impl ObjectSource for UnconfiguredSource {
    async fn fetch(&self, oid: &Oid, _size: u64, _dest: &Path) -> Result<()> {
        Err(FilterError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no LFS remote configured to fetch {}", oid),
        )))
    }
}

pub type SharedSource = Arc<dyn ObjectSource>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            delay: Duration::from_millis(100),
        }
    }
}

fn is_retriable(err: &FilterError) -> bool {
    !matches!(err, FilterError::Io(e) if e.kind() == io::ErrorKind::NotFound)
}

/// Fetch `oid` into `dest` through a temp file in `tmp_dir`, verifying size
/// and hash before the rename. No-op if `dest` already holds the object.
pub async fn download_object(
    source: &dyn ObjectSource,
    oid: &Oid,
    size: u64,
    dest: &Path,
    tmp_dir: &Path,
) -> Result<()> {
    if object_matches(dest, size).await {
        return Ok(());
    }

    fs::create_dir_all(tmp_dir).await?;
    let temp_path = new_temp_path(tmp_dir, oid.as_str())?;
    source.fetch(oid, size, &temp_path).await?;

    let (actual_oid, actual_size) = hash_file(&temp_path).await?;
    if actual_size != size {
        return Err(FilterError::transfer(
            oid.as_str(),
            format!("expected {} bytes, got {}", size, actual_size),
        ));
    }
    if &actual_oid != oid {
        return Err(FilterError::transfer(
            oid.as_str(),
            format!("content hashes to {}", actual_oid),
        ));
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    temp_path
        .persist(dest)
        .map_err(|e| FilterError::Io(e.error))?;
    Ok(())
}

/// [`download_object`] with retries. Missing objects are not retried.
pub async fn fetch_with_retries(
    source: &dyn ObjectSource,
    oid: &Oid,
    size: u64,
    dest: &Path,
    tmp_dir: &Path,
    policy: RetryPolicy,
) -> Result<()> {
    let mut delay = policy.delay;
    let mut attempt = 0;
    loop {
        match download_object(source, oid, size, dest, tmp_dir).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.max_retries && is_retriable(&e) => {
                attempt += 1;
                tracing::debug!(%oid, attempt, error = %e, "retrying fetch");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }
}
