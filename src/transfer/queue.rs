//! Download queue.
//!
//! `add` never blocks: jobs go over an unbounded channel to a dispatcher task
//! that runs at most `concurrent_transfers` workers. Every finished job is
//! reported on the completion channel handed out by `watch`.

use crate::error::{FilterError, Result};
use crate::transfer::channel::{
    completion_channel, job_channel, Completion, CompletionReceiver, CompletionSender,
    JobReceiver, JobSender, QueueMessage, TransferRecord,
};
use crate::transfer::source::{fetch_with_retries, RetryPolicy, SharedSource};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum fetches in flight
    pub concurrent_transfers: usize,
    pub retry: RetryPolicy,
    /// Staging directory for downloads
    pub tmp_dir: PathBuf,
}

pub struct TransferQueue {
    jobs: JobSender,
    closed: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    completions: Option<CompletionReceiver>,
}

impl TransferQueue {
    /// Spawn the dispatcher. Must be called inside a Tokio runtime.
    pub fn new(source: SharedSource, config: QueueConfig) -> Self {
        let (jobs, job_rx) = job_channel();
        let (done_tx, done_rx) = completion_channel();
        let dispatcher = tokio::spawn(dispatch(job_rx, source, config, done_tx));

        Self {
            jobs,
            closed: AtomicBool::new(false),
            dispatcher: Mutex::new(Some(dispatcher)),
            completions: Some(done_rx),
        }
    }

    /// Submit a fetch.
    pub fn add(&self, record: TransferRecord) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FilterError::QueueClosed);
        }
        self.jobs
            .send(QueueMessage::Fetch(record))
            .map_err(|_| FilterError::QueueClosed)
    }

    /// Take the completion stream. Only the first call returns it.
    pub fn watch(&mut self) -> Option<CompletionReceiver> {
        self.completions.take()
    }

    /// Stop accepting work and wait until every submitted fetch has finished.
    pub async fn close_and_wait(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let _ = self.jobs.send(QueueMessage::Close);

        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| FilterError::transfer("queue", format!("dispatcher failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.get_mut().take() {
            handle.abort();
        }
    }
}

/// Aborts the fetch task when its worker is aborted.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn dispatch(
    mut jobs: JobReceiver,
    source: SharedSource,
    config: QueueConfig,
    completions: CompletionSender,
) {
    let permits = Arc::new(Semaphore::new(config.concurrent_transfers.max(1)));
    let mut workers = JoinSet::new();

    while let Some(msg) = jobs.recv().await {
        let record = match msg {
            QueueMessage::Fetch(record) => record,
            QueueMessage::Close => {
                // Already-queued fetches are still received below.
                jobs.close();
                continue;
            }
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let source = source.clone();
        let completions = completions.clone();
        let tmp_dir = config.tmp_dir.clone();
        let retry = config.retry;

        workers.spawn(async move {
            let _permit = permit;
            tracing::debug!(pathname = %record.pathname, oid = %record.oid, "fetching object");
            let job = record.clone();
            let fetch = tokio::spawn(async move {
                fetch_with_retries(
                    source.as_ref(),
                    &job.oid,
                    job.size,
                    &job.local_path,
                    &tmp_dir,
                    retry,
                )
                .await
            });
            let guard = AbortOnDrop(fetch.abort_handle());

            // A fetch that panics still owes the coordinator a completion.
            let outcome = fetch.await.unwrap_or_else(|e| {
                Err(FilterError::transfer(
                    record.oid.as_str(),
                    format!("fetch task failed: {}", e),
                ))
            });
            drop(guard);
            let _ = completions.send(Completion { record, outcome });
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::warn!("transfer worker failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lfs::pointer::Oid;
    use crate::lfs::store::LocalStore;
    use crate::transfer::source::{DirectorySource, ObjectSource};
    use async_trait::async_trait;
    use std::path::Path;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tempfile::TempDir;

    fn put_object(store: &LocalStore, content: &[u8]) -> Oid {
        let oid = Oid::from_digest(&Sha256::digest(content));
        let path = store.object_path(&oid);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
        oid
    }

    fn queue(temp: &TempDir) -> TransferQueue {
        TransferQueue::new(
            Arc::new(DirectorySource::new(temp.path().join("remote"))),
            QueueConfig {
                concurrent_transfers: 2,
                retry: RetryPolicy {
                    max_retries: 0,
                    delay: Duration::from_millis(1),
                },
                tmp_dir: temp.path().join("local/tmp"),
            },
        )
    }

    #[tokio::test]
    async fn test_every_job_completes() {
        let temp = TempDir::new().unwrap();
        let remote = LocalStore::new(temp.path().join("remote"));
        let local = LocalStore::new(temp.path().join("local"));

        let mut q = queue(&temp);
        let mut completions = q.watch().unwrap();
        assert!(q.watch().is_none());

        let present = put_object(&remote, b"present");
        let missing = Oid::from_digest(&[3; 32]);
        for (name, oid, size) in [("a.bin", &present, 7), ("b.bin", &missing, 1)] {
            q.add(TransferRecord {
                pathname: name.to_string(),
                oid: oid.clone(),
                size,
                local_path: local.object_path(oid),
            })
            .unwrap();
        }
        q.close_and_wait().await.unwrap();

        let mut results = Vec::new();
        while let Some(c) = completions.recv().await {
            results.push((c.record.pathname.clone(), c.outcome.is_ok()));
        }
        results.sort();
        assert_eq!(
            results,
            vec![("a.bin".to_string(), true), ("b.bin".to_string(), false)]
        );
        assert!(local.has_object(&present, 7).await);
    }

    #[tokio::test]
    async fn test_add_after_close_is_rejected() {
        let temp = TempDir::new().unwrap();
        let q = queue(&temp);
        q.close_and_wait().await.unwrap();

        let err = q
            .add(TransferRecord {
                pathname: "late.bin".to_string(),
                oid: Oid::from_digest(&[1; 32]),
                size: 1,
                local_path: temp.path().join("late"),
            })
            .unwrap_err();
        assert!(matches!(err, FilterError::QueueClosed));

        // A second close is harmless.
        q.close_and_wait().await.unwrap();
    }

    struct PanickingSource;

    #[async_trait]
    impl ObjectSource for PanickingSource {
        async fn fetch(&self, _oid: &Oid, _size: u64, _dest: &Path) -> Result<()> {
            panic!("source blew up");
        }
    }

    #[tokio::test]
    async fn test_panicking_fetch_still_completes() {
        let temp = TempDir::new().unwrap();
        let mut q = TransferQueue::new(
            Arc::new(PanickingSource),
            QueueConfig {
                concurrent_transfers: 1,
                retry: RetryPolicy {
                    max_retries: 0,
                    delay: Duration::from_millis(1),
                },
                tmp_dir: temp.path().join("tmp"),
            },
        );
        let mut completions = q.watch().unwrap();

        q.add(TransferRecord {
            pathname: "boom.bin".to_string(),
            oid: Oid::from_digest(&[4; 32]),
            size: 4,
            local_path: temp.path().join("boom"),
        })
        .unwrap();
        q.close_and_wait().await.unwrap();

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.record.pathname, "boom.bin");
        assert!(matches!(completion.outcome, Err(FilterError::Transfer { .. })));
        assert!(completions.recv().await.is_none());
    }
}
