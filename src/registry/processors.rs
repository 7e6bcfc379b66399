use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use uuid::Uuid;

use super::DispatcherEntry;
use crate::batch::{BatchProcessor, BatchWork};
use crate::error::{BatchError, BatchResult};
use crate::retry::Retry;
use crate::store::Store;
use crate::types::RoutingKey;

/// Sending half of a live processor, tagged with the generation it was created in
struct ProcessorHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<BatchWork>,
}

/// One live batch processor per routing key
///
/// Processors are created on first use and remove themselves when idle. A
/// processor only removes the entry carrying its own generation, so a
/// replacement created while it was shutting down is never evicted.
pub struct ProcessorRegistry {
    processors: Mutex<HashMap<RoutingKey, ProcessorHandle>>,
    next_generation: AtomicU64,
    store: Arc<dyn Store>,
    retry: Retry,
    cancel: CancellationToken,
    tracker: TaskTracker,
    /// Ids of confirmed batches, read by the sequencer
    confirmed: mpsc::UnboundedSender<Uuid>,
}

impl ProcessorRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        retry: Retry,
        cancel: CancellationToken,
        tracker: TaskTracker,
        confirmed: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        Self {
            processors: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            store,
            retry,
            cancel,
            tracker,
            confirmed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RoutingKey, ProcessorHandle>> {
        self.processors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `work` to the processor for `key`, starting one if needed.
    ///
    /// Delivery is not acceptance: a processor that is shutting down answers
    /// the work with [`BatchError::ProcessorDisposed`] and the caller routes
    /// it again.
    pub fn route(
        self: &Arc<Self>,
        key: RoutingKey,
        entry: Arc<DispatcherEntry>,
        work: BatchWork,
    ) -> BatchResult<()> {
        if self.cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }

        let mut processors = self.lock();
        let work = match processors.get(&key) {
            Some(handle) => match handle.tx.send(work) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(work)) => {
                    processors.remove(&key);
                    work
                }
            },
            None => work,
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        processors.insert(key.clone(), ProcessorHandle { generation, tx });
        debug!(key = %key, generation, "starting batch processor");

        let processor = BatchProcessor::new(
            key,
            generation,
            entry,
            self.store.clone(),
            self.retry.clone(),
            self.cancel.clone(),
            Arc::clone(self),
            rx,
        );
        self.tracker.spawn(processor.run(work));
        Ok(())
    }

    /// Remove the processor of `generation` from the table and stop its queue.
    ///
    /// Closing happens under the table lock, so after this returns every send
    /// to the old queue either already landed (and can be drained) or fails.
    pub(crate) fn retire(
        &self,
        key: &RoutingKey,
        generation: u64,
        rx: &mut mpsc::UnboundedReceiver<BatchWork>,
    ) {
        let mut processors = self.lock();
        if processors
            .get(key)
            .is_some_and(|handle| handle.generation == generation)
        {
            processors.remove(key);
        }
        rx.close();
    }

    /// Report a batch whose dispatch and confirmation committed
    pub(crate) fn batch_confirmed(&self, batch_id: Uuid) {
        let _ = self.confirmed.send(batch_id);
    }

    /// Number of live processors
    pub fn active(&self) -> usize {
        self.lock().len()
    }
}
