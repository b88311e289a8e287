//! Git LFS long-running filter process.
//!
//! Speaks Git's `filter.<driver>.process` protocol: `clean` turns working
//! tree content into pointers, `smudge` turns pointers back into content,
//! and with the `delay` capability smudges are fetched in the background and
//! collected through `list_available_blobs`.

pub mod config;
pub mod error;
pub mod filter;
pub mod lfs;
pub mod server;
pub mod transfer;

pub use error::{FilterError, Result};
