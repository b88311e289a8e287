//! Git's long-running filter protocol (`filter.<driver>.process`).
//!
//! ```text
//! stdin -> scanner -> FilterSession::run -> clean | smudge | list_available_blobs
//!                           |                        |
//!                           v                        v
//!          stdout <- status + content     DelayedFetchCoordinator <- TransferQueue
//! ```
//!
//! - `protocol`: pkt-line framing
//! - `scanner`: handshake, capabilities and requests on top of pkt-lines
//! - `session`: per-request dispatch
//! - `coordinator`: delayed fetches and the drain barrier
//! - `status` / `diagnostics`: how turns are answered and summarized

pub mod coordinator;
pub mod diagnostics;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod status;

pub use coordinator::DelayedFetchCoordinator;
pub use diagnostics::Diagnostics;
pub use scanner::{Capabilities, Request};
pub use session::{serve, FilterSession, SessionOptions};
pub use status::{Command, Status, TurnOutcome};
