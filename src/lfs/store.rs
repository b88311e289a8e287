//! Local object storage (`.git/lfs`).
//!
//! Objects live at `objects/<oid[0..2]>/<oid[2..4]>/<oid>`; in-progress
//! writes go to `tmp/` and are renamed into place once hashed.

use crate::error::{FilterError, Result};
use crate::lfs::pointer::{Oid, Pointer};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read buffer for hashing and copying objects (64KB)
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Where `oid` lives, whether or not it exists yet.
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        let s = oid.as_str();
        self.objects_dir().join(&s[0..2]).join(&s[2..4]).join(s)
    }

    /// Like [`object_path`](Self::object_path), creating the parent directories.
    pub async fn local_media_path(&self, oid: &Oid) -> Result<PathBuf> {
        let path = self.object_path(oid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }

    pub async fn has_object(&self, oid: &Oid, size: u64) -> bool {
        object_matches(&self.object_path(oid), size).await
    }

    /// Start writing a new object into `tmp/`.
    pub async fn stage(&self) -> Result<StagedObject> {
        let tmp_dir = self.tmp_dir();
        fs::create_dir_all(&tmp_dir).await?;
        let temp_path = new_temp_path(&tmp_dir, "clean")?;
        let file = File::create(&temp_path).await?;
        Ok(StagedObject {
            temp_path,
            file,
            hasher: Sha256::new(),
            size: 0,
        })
    }
}

/// An object being written; dropped without `commit` it is removed.
pub struct StagedObject {
    temp_path: TempPath,
    file: File,
    hasher: Sha256,
    size: u64,
}

impl StagedObject {
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.size += data.len() as u64;
        self.file.write_all(data).await?;
        Ok(())
    }

    /// Move the object into place and return its pointer.
    pub async fn commit(mut self, store: &LocalStore) -> Result<Pointer> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        let oid = Oid::from_digest(&self.hasher.finalize());
        let dest = store.local_media_path(&oid).await?;
        if object_matches(&dest, self.size).await {
            // Already stored; the temp file is removed on drop.
            return Ok(Pointer::new(oid, self.size));
        }
        self.temp_path
            .persist(&dest)
            .map_err(|e| FilterError::Io(e.error))?;
        Ok(Pointer::new(oid, self.size))
    }
}

pub(crate) fn new_temp_path(dir: &Path, prefix: &str) -> Result<TempPath> {
    let file = tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;
    Ok(file.into_temp_path())
}

pub async fn object_matches(path: &Path, size: u64) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() == size,
        Err(_) => false,
    }
}

/// SHA-256 and length of a file's content.
pub async fn hash_file(path: &Path) -> Result<(Oid, u64)> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((Oid::from_digest(&hasher.finalize()), size))
}
