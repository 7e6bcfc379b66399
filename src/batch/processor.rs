//! Batch Processor Module
//!
//! One processor runs per active routing key. It owns the assembler for that
//! key and moves through these states:
//!
//! - `Idle`: nothing buffered; the dispose timer runs and, when it fires, the
//!   processor retires from the registry and exits
//! - `Accumulating`: a batch is open and recorded in the store; the batch
//!   timer runs from the first message
//! - `Sealing`: the open batch is frozen and hashed
//! - `Dispatching`: pin contexts, dispatch, and confirmation run as one store
//!   group, retried with backoff
//!
//! A batch whose dispatch still fails after the last retry is held: it keeps
//! its members, takes no new work, and is dispatched again after a backoff.
//! Work routed meanwhile waits in the queue.
//!
//! Every message is acknowledged with its batch id as soon as the open batch
//! has been recorded, before any sealing happens.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::assembler::{AddOutcome, BatchAssembler};
use super::trigger::SealTrigger;
use crate::error::{BatchError, BatchResult};
use crate::pins;
use crate::registry::{DispatcherEntry, ProcessorRegistry};
use crate::retry::Retry;
use crate::store::Store;
use crate::types::{Batch, BatchUpdate, Data, Message, MessageUpdate, RoutingKey};

/// A resolved message handed to a processor
///
/// `reply` receives the id of the batch the message was recorded in.
pub struct BatchWork {
    pub message: Message,
    pub data: Vec<Data>,
    pub reply: oneshot::Sender<BatchResult<Uuid>>,
}

impl BatchWork {
    pub fn new(
        message: Message,
        data: Vec<Data>,
    ) -> (Self, oneshot::Receiver<BatchResult<Uuid>>) {
        let (reply, response) = oneshot::channel();
        (
            Self {
                message,
                data,
                reply,
            },
            response,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Accumulating,
    Sealing,
    Dispatching,
    Disposed,
}

/// Batch processor for one routing key
pub struct BatchProcessor {
    key: RoutingKey,
    /// Registry generation this processor was created in
    generation: u64,
    entry: Arc<DispatcherEntry>,
    store: Arc<dyn Store>,
    retry: Retry,
    cancel: CancellationToken,
    registry: Arc<ProcessorRegistry>,
    rx: mpsc::UnboundedReceiver<BatchWork>,
    assembler: BatchAssembler,
    trigger: SealTrigger,
    state: ProcessorState,
    /// A sealed batch failed to dispatch and is waiting for another attempt
    held: bool,
    batch_deadline: Instant,
    idle_deadline: Instant,
}

impl BatchProcessor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: RoutingKey,
        generation: u64,
        entry: Arc<DispatcherEntry>,
        store: Arc<dyn Store>,
        retry: Retry,
        cancel: CancellationToken,
        registry: Arc<ProcessorRegistry>,
        rx: mpsc::UnboundedReceiver<BatchWork>,
    ) -> Self {
        let trigger = SealTrigger::new(&entry.options);
        let now = Instant::now();
        Self {
            assembler: BatchAssembler::new(key.clone()),
            idle_deadline: now + entry.options.dispose_timeout,
            batch_deadline: now,
            key,
            generation,
            entry,
            store,
            retry,
            cancel,
            registry,
            rx,
            trigger,
            state: ProcessorState::Idle,
            held: false,
        }
    }

    /// Process `first` and then everything routed here until the processor
    /// is idle for longer than its dispose timeout or the manager stops.
    pub async fn run(mut self, first: BatchWork) {
        debug!(key = %self.key, generation = self.generation, "batch processor started");
        self.accept(first).await;

        loop {
            let accumulating = !self.assembler.is_empty();
            let intake = !self.held;
            let batch_deadline = self.batch_deadline;
            let idle_deadline = self.idle_deadline;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                work = self.rx.recv(), if intake => {
                    match work {
                        Some(work) => self.accept(work).await,
                        None => break,
                    }
                }
                _ = sleep_until(batch_deadline), if accumulating => {
                    debug!(key = %self.key, "batch timeout reached");
                    self.seal_and_dispatch().await;
                }
                _ = sleep_until(idle_deadline), if !accumulating => break,
            }
        }

        self.dispose();
    }

    async fn accept(&mut self, work: BatchWork) {
        let BatchWork {
            message,
            data,
            reply,
        } = work;
        let result = self.add(message, data).await;
        let _ = reply.send(result);

        if !self.assembler.is_empty() && self.trigger.is_full(self.assembler.len()) {
            self.seal_and_dispatch().await;
        }
    }

    /// Add a message to the open batch and record the batch in the store
    async fn add(&mut self, message: Message, data: Vec<Data>) -> BatchResult<Uuid> {
        let message_id = message.id();
        let outcome = self.assembler.add(message, data);
        let Some(batch) = self.assembler.inflight() else {
            return Err(BatchError::ProcessorDisposed(self.key.to_string()));
        };
        let batch_id = batch.id;

        let persisted = match outcome {
            AddOutcome::Duplicate => {
                debug!(key = %self.key, %batch_id, %message_id, "message already in open batch");
                return Ok(batch_id);
            }
            AddOutcome::Opened => self.store.upsert_batch(batch, true).await,
            AddOutcome::Appended => {
                let update = BatchUpdate {
                    payload: Some(batch.payload.clone()),
                    ..Default::default()
                };
                self.store.update_batch(&batch_id, &update).await
            }
        };

        if let Err(err) = persisted {
            warn!(key = %self.key, %batch_id, %message_id, error = %err, "failed to record message in batch");
            self.assembler.undo_last();
            return Err(BatchError::Store(err));
        }

        if outcome == AddOutcome::Opened {
            self.batch_deadline = self.trigger.deadline(Instant::now());
            self.transition(ProcessorState::Accumulating);
        }
        debug!(
            key = %self.key,
            %batch_id,
            %message_id,
            len = self.assembler.len(),
            "message added to batch"
        );
        Ok(batch_id)
    }

    async fn seal_and_dispatch(&mut self) {
        self.transition(ProcessorState::Sealing);
        let sealed = match self.assembler.seal() {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                self.enter_idle();
                return;
            }
            Err(err) => {
                error!(key = %self.key, error = %err, "failed to seal batch");
                self.retry_later();
                return;
            }
        };

        self.transition(ProcessorState::Dispatching);
        let store = self.store.clone();
        let entry = self.entry.clone();
        let result = self
            .retry
            .run(&self.cancel, "batch dispatch", |_| {
                dispatch_sealed(store.clone(), entry.clone(), sealed.clone())
            })
            .await;

        match result {
            Ok(batch) => {
                info!(
                    key = %self.key,
                    batch_id = %batch.id,
                    messages = batch.payload.messages.len(),
                    "batch dispatched"
                );
                self.held = false;
                self.registry.batch_confirmed(batch.id);
                self.assembler.reset();
                self.enter_idle();
            }
            Err(BatchError::Cancelled) => self.transition(ProcessorState::Accumulating),
            Err(err) => {
                error!(
                    key = %self.key,
                    batch_id = %sealed.id,
                    error = %err,
                    "batch dispatch failed, keeping messages for the next attempt"
                );
                self.hold();
            }
        }
    }

    fn enter_idle(&mut self) {
        self.idle_deadline = Instant::now() + self.entry.options.dispose_timeout;
        self.transition(ProcessorState::Idle);
    }

    /// Keep the open batch and try sealing it again later
    fn retry_later(&mut self) {
        let backoff = self.trigger.timeout.max(self.retry.maximum_delay);
        self.batch_deadline = Instant::now() + backoff;
        self.transition(ProcessorState::Accumulating);
    }

    /// Freeze the sealed batch until a later dispatch attempt succeeds
    fn hold(&mut self) {
        self.held = true;
        self.retry_later();
    }

    fn transition(&mut self, next: ProcessorState) {
        if self.state != next {
            trace!(key = %self.key, from = ?self.state, to = ?next, "processor state");
            self.state = next;
        }
    }

    /// Leave the registry and turn away work that raced in
    fn dispose(&mut self) {
        self.transition(ProcessorState::Disposed);
        self.registry.retire(&self.key, self.generation, &mut self.rx);

        let mut rejected = 0usize;
        while let Ok(work) = self.rx.try_recv() {
            let _ = work
                .reply
                .send(Err(BatchError::ProcessorDisposed(self.key.to_string())));
            rejected += 1;
        }
        debug!(
            key = %self.key,
            generation = self.generation,
            rejected,
            unsealed = self.assembler.len(),
            "batch processor disposed"
        );
    }
}

/// Dispatch a sealed batch and confirm it, all in one store group.
///
/// # Returns
/// The batch as confirmed, including anything the dispatcher set on it
pub async fn dispatch_sealed(
    store: Arc<dyn Store>,
    entry: Arc<DispatcherEntry>,
    mut batch: Batch,
) -> BatchResult<Batch> {
    let group_store = store.as_ref();
    let work = async {
        let contexts = pins::batch_contexts(group_store, &batch).await?;
        entry
            .dispatcher
            .dispatch(&mut batch, &contexts)
            .await
            .map_err(BatchError::Dispatch)?;

        let confirmed = Utc::now();
        batch.confirmed = Some(confirmed);
        group_store.upsert_batch(&batch, true).await?;
        group_store
            .update_messages(&batch.message_ids(), &MessageUpdate::confirmed(batch.id, confirmed))
            .await?;
        Ok::<_, anyhow::Error>(())
    };

    store
        .run_as_group(Box::pin(work))
        .await
        .map_err(BatchError::from_group)?;
    Ok(batch)
}
