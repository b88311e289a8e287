//! Delayed-fetch coordination.
//!
//! Smudge requests that Git allows to be delayed are handed to the transfer
//! queue and answered `delayed`. A listener task moves finished transfers
//! into the availability map. `list_available_blobs` drains the queue once,
//! after which the map is settled and Git re-requests each listed pathname.
//!
//! ```text
//! request_fetch ──> TransferQueue ──> completions ──> listener ──> available
//!                                                                     │
//! list_available_blobs ──> drain_once ──────────────────────────> available()
//! ```

use crate::error::{FilterError, Result};
use crate::lfs::pointer::Oid;
use crate::transfer::{CompletionReceiver, TransferQueue, TransferRecord};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

const UNTOUCHED: u8 = 0;
const DRAINING: u8 = 1;
const DRAINED: u8 = 2;

type AvailabilityMap = Arc<Mutex<HashMap<String, TransferRecord>>>;

pub struct DelayedFetchCoordinator {
    queue: TransferQueue,
    available: AvailabilityMap,
    /// Fetches requested whose completion the listener has not processed yet.
    pending: Arc<watch::Sender<usize>>,
    drain_state: AtomicU8,
    drained: watch::Sender<bool>,
    listener: JoinHandle<()>,
}

impl DelayedFetchCoordinator {
    /// Take over `queue` and start listening for its completions.
    pub fn new(mut queue: TransferQueue) -> Result<Self> {
        let completions = queue.watch().ok_or_else(|| {
            FilterError::transfer("queue", "completion stream already taken")
        })?;
        let available = AvailabilityMap::default();
        let pending = Arc::new(watch::Sender::new(0usize));
        let listener = tokio::spawn(listen(completions, available.clone(), pending.clone()));

        Ok(Self {
            queue,
            available,
            pending,
            drain_state: AtomicU8::new(UNTOUCHED),
            drained: watch::Sender::new(false),
            listener,
        })
    }

    /// Start fetching an object in the background.
    ///
    /// Fails with [`FilterError::QueueClosed`] once a drain has begun.
    pub fn request_fetch(
        &self,
        pathname: &str,
        local_path: PathBuf,
        oid: Oid,
        size: u64,
    ) -> Result<()> {
        if self.drain_state.load(Ordering::Acquire) != UNTOUCHED {
            return Err(FilterError::QueueClosed);
        }

        self.pending.send_modify(|n| *n += 1);
        let record = TransferRecord {
            pathname: pathname.to_string(),
            oid,
            size,
            local_path,
        };
        if let Err(e) = self.queue.add(record) {
            self.pending.send_modify(|n| *n -= 1);
            return Err(e);
        }
        Ok(())
    }

    /// Close the queue and wait until every requested fetch is in the
    /// availability map. Only the first call does the work; later calls
    /// wait for it to finish.
    pub async fn drain_once(&self) -> Result<()> {
        let won = self
            .drain_state
            .compare_exchange(UNTOUCHED, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if !won {
            let mut drained = self.drained.subscribe();
            // The sender lives in `self`, so this cannot observe a closed channel.
            let _ = drained.wait_for(|done| *done).await;
            return Ok(());
        }

        let result = self.queue.close_and_wait().await;
        match &result {
            Ok(()) => {
                let mut pending = self.pending.subscribe();
                let _ = pending.wait_for(|n| *n == 0).await;
            }
            Err(e) => {
                tracing::warn!("transfer queue did not shut down cleanly: {}", e);
            }
        }

        self.drain_state.store(DRAINED, Ordering::Release);
        self.drained.send_replace(true);
        let available = self.available.lock().await.len();
        tracing::debug!(available, "delayed fetches drained");
        result
    }

    /// Remove and return the finished transfer for `pathname`.
    pub async fn consume(&self, pathname: &str) -> Option<TransferRecord> {
        self.available.lock().await.remove(pathname)
    }

    /// Pathnames currently ready, sorted.
    pub async fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.available.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn is_drained(&self) -> bool {
        self.drain_state.load(Ordering::Acquire) == DRAINED
    }

    /// End of session. Fetches still in flight are abandoned.
    pub fn shutdown(self) {
        let abandoned = self.pending();
        if abandoned > 0 {
            tracing::debug!(abandoned, "abandoning in-flight fetches");
        }
        // Dropping aborts the listener, and the queue aborts its dispatcher.
        drop(self);
    }
}

impl Drop for DelayedFetchCoordinator {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(
    mut completions: CompletionReceiver,
    available: AvailabilityMap,
    pending: Arc<watch::Sender<usize>>,
) {
    while let Some(completion) = completions.recv().await {
        if let Err(e) = &completion.outcome {
            // Still recorded: Git re-requests the path and gets `error` then.
            tracing::warn!(
                pathname = %completion.record.pathname,
                oid = %completion.record.oid,
                "delayed fetch failed: {}",
                e
            );
        }
        let record = completion.record;
        available.lock().await.insert(record.pathname.clone(), record);
        pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}
