//! Error types for the filter process.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    /// Git sent something the protocol does not allow (unknown command,
    /// re-request of a pathname that was never delayed, bad header line).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The pkt-line stream failed for a reason other than a clean end-of-stream.
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),

    /// The initial `git-filter-client` exchange was malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Smudge input was not a recognized pointer.
    #[error("not a valid Git LFS pointer: {0}")]
    NotAPointer(String),

    /// Fetching or copying a stored object failed.
    #[error("transfer of {oid} failed: {reason}")]
    Transfer { oid: String, reason: String },

    /// A fetch was requested after the transfer queue stopped accepting work.
    #[error("transfer queue is closed")]
    QueueClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl FilterError {
    /// Fatal errors terminate the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FilterError::ProtocolViolation(_) | FilterError::Transport(_) | FilterError::Handshake(_)
        )
    }

    pub fn transfer(oid: impl Into<String>, reason: impl ToString) -> Self {
        FilterError::Transfer {
            oid: oid.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(FilterError::ProtocolViolation("x".into()).is_fatal());
        assert!(FilterError::Handshake("x".into()).is_fatal());
        assert!(FilterError::Transport(io::Error::from(io::ErrorKind::BrokenPipe)).is_fatal());

        assert!(!FilterError::NotAPointer("x".into()).is_fatal());
        assert!(!FilterError::QueueClosed.is_fatal());
        assert!(!FilterError::transfer("abc", "missing").is_fatal());
        assert!(!FilterError::Io(io::Error::from(io::ErrorKind::NotFound)).is_fatal());
    }

    #[test]
    fn test_transfer_message() {
        let err = FilterError::transfer("deadbeef", "not found");
        assert_eq!(err.to_string(), "transfer of deadbeef failed: not found");
    }
}
