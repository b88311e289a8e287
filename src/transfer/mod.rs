//! Fetch pipeline for delayed and synchronous smudges.
//!
//! ```text
//! +-----------+  QueueMessage  +------------+  spawn  +---------+  Completion  +-------------+
//! |  session  | -------------> | dispatcher | ------> | workers | -----------> | coordinator |
//! +-----------+                +------------+         +---------+              +-------------+
//! ```

pub mod channel;
pub mod queue;
pub mod source;

pub use channel::{Completion, CompletionReceiver, QueueMessage, TransferRecord};
pub use queue::{QueueConfig, TransferQueue};
pub use source::{
    download_object, fetch_with_retries, DirectorySource, ObjectSource, RetryPolicy,
    SharedSource, UnconfiguredSource,
};
