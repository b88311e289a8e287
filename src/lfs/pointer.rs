//! Git LFS pointer files.
//!
//! ```text
//! version https://git-lfs.github.com/spec/v1
//! oid sha256:4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393
//! size 12345
//! ```

use crate::error::{FilterError, Result};
use std::fmt;
use std::str::FromStr;

/// Current pointer spec URL
pub const VERSION_LATEST: &str = "https://git-lfs.github.com/spec/v1";

/// Pre-release spec URL, still accepted on read
pub const VERSION_LEGACY: &str = "https://hawser.github.com/spec/v1";

/// Anything larger than this cannot be a pointer
pub const BLOB_SIZE_CUTOFF: usize = 1024;

pub const OID_TYPE: &str = "sha256";

const OID_HEX_LEN: usize = 64;

// =============================================================================
// Oid
// =============================================================================

/// Lowercase hex SHA-256 object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(String);

impl Oid {
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != OID_HEX_LEN || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(FilterError::NotAPointer(format!("invalid oid {:?}", s)));
        }
        Ok(Oid(s.to_string()))
    }

    pub fn from_digest(digest: &[u8]) -> Self {
        Oid(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Oid {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        Oid::parse(s)
    }
}

// =============================================================================
// Pointer
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    pub version: String,
    pub oid: Oid,
    pub size: u64,
    /// `ext-*` lines, kept in file order.
    pub extensions: Vec<(String, String)>,
}

impl Pointer {
    pub fn new(oid: Oid, size: u64) -> Self {
        Self {
            version: VERSION_LATEST.to_string(),
            oid,
            size,
            extensions: Vec::new(),
        }
    }

    /// Canonical text: `version` first, remaining keys in sorted order.
    pub fn encode(&self) -> String {
        let mut out = format!("version {}\n", self.version);
        for (key, value) in &self.extensions {
            out.push_str(&format!("{} {}\n", key, value));
        }
        out.push_str(&format!("oid {}:{}\n", OID_TYPE, self.oid));
        out.push_str(&format!("size {}\n", self.size));
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let not_a_pointer = |msg: String| FilterError::NotAPointer(msg);

        if data.len() > BLOB_SIZE_CUTOFF {
            return Err(not_a_pointer(format!("{} bytes is too large", data.len())));
        }
        let text = std::str::from_utf8(data)
            .map_err(|_| not_a_pointer("content is not UTF-8".to_string()))?;
        if text.trim().is_empty() {
            return Err(not_a_pointer("empty content".to_string()));
        }

        let mut lines = text.lines().filter(|l| !l.is_empty());

        let version = match lines.next().and_then(|l| l.split_once(' ')) {
            Some(("version", v)) if v == VERSION_LATEST || v == VERSION_LEGACY => v.to_string(),
            _ => return Err(not_a_pointer("missing version header".to_string())),
        };

        let mut oid = None;
        let mut size = None;
        let mut extensions = Vec::new();
        let mut last_key = String::new();

        for line in lines {
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| not_a_pointer(format!("malformed line {:?}", line)))?;
            if key <= last_key.as_str() {
                return Err(not_a_pointer(format!("key {:?} out of order", key)));
            }
            last_key = key.to_string();

            match key {
                "oid" => {
                    let hex = value
                        .strip_prefix("sha256:")
                        .ok_or_else(|| not_a_pointer(format!("unsupported oid {:?}", value)))?;
                    oid = Some(Oid::parse(hex)?);
                }
                "size" => {
                    let parsed = value
                        .parse::<u64>()
                        .map_err(|_| not_a_pointer(format!("invalid size {:?}", value)))?;
                    size = Some(parsed);
                }
                k if k.starts_with("ext-") => extensions.push((key.to_string(), value.to_string())),
                _ => return Err(not_a_pointer(format!("unknown key {:?}", key))),
            }
        }

        match (oid, size) {
            (Some(oid), Some(size)) => Ok(Pointer {
                version,
                oid,
                size,
                extensions,
            }),
            (None, _) => Err(not_a_pointer("missing oid".to_string())),
            (_, None) => Err(not_a_pointer("missing size".to_string())),
        }
    }
}
