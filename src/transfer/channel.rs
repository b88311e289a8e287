//! Channel types for the transfer pipeline.
//!
//! Session -> TransferQueue (jobs) -> workers -> completions -> coordinator.

use crate::error::FilterError;
use crate::lfs::pointer::Oid;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// One deferred fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    /// Worktree path Git asked about
    pub pathname: String,
    pub oid: Oid,
    pub size: u64,
    /// Where the object is written in the local store
    pub local_path: PathBuf,
}

/// Message into the queue's dispatcher
#[derive(Debug)]
pub enum QueueMessage {
    Fetch(TransferRecord),
    /// Stop accepting work; queued fetches still run.
    Close,
}

/// A finished transfer, successful or not.
#[derive(Debug)]
pub struct Completion {
    pub record: TransferRecord,
    pub outcome: Result<(), FilterError>,
}

pub type JobSender = mpsc::UnboundedSender<QueueMessage>;
pub type JobReceiver = mpsc::UnboundedReceiver<QueueMessage>;
pub type CompletionSender = mpsc::UnboundedSender<Completion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

pub fn job_channel() -> (JobSender, JobReceiver) {
    mpsc::unbounded_channel()
}

pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completion_channel() {
        let (tx, mut rx) = completion_channel();
        let record = TransferRecord {
            pathname: "big.bin".to_string(),
            oid: Oid::from_digest(&[1; 32]),
            size: 10,
            local_path: PathBuf::from("/tmp/x"),
        };

        tx.send(Completion {
            record: record.clone(),
            outcome: Err(FilterError::QueueClosed),
        })
        .unwrap();
        drop(tx);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.record, record);
        assert!(!received.outcome.is_ok());
        assert!(rx.recv().await.is_none());
    }
}
