//! Git LFS object model: pointers, local storage and the clean/smudge
//! transforms.

pub mod path_filter;
pub mod pointer;
pub mod store;
pub mod transform;

pub use path_filter::PathFilter;
pub use pointer::{Oid, Pointer, BLOB_SIZE_CUTOFF};
pub use store::LocalStore;
pub use transform::{clean, decode_from, smudge, smudge_decoded, Decoded, SmudgeContext};
