//! Message Sequencer
//!
//! Reads messages in sequence order past a read cursor and hands each to the
//! batch processor for its routing key. A page is committed in two steps:
//!
//! 1. Every message is routed and answered with the id of the open batch it
//!    was recorded in. Processors record open batches themselves.
//! 2. One store group marks the routed messages with their batch ids and
//!    moves the durable offset.
//!
//! The durable offset never passes a message whose batch has not been
//! confirmed yet. Processors report every confirmed batch back, and the
//! offset then catches up with the cursor. After a restart every message in
//! a batch that was still open is read again.
//!
//! If anything fails before step 2 completes, the page is read again from the
//! old cursor. Processors recognise messages they already hold, so the
//! replay lands in the same batches.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::offset::OffsetStore;
use crate::batch::BatchWork;
use crate::config::ManagerConfig;
use crate::error::{BatchError, BatchResult};
use crate::registry::{DispatcherRegistry, ProcessorRegistry};
use crate::retry::Retry;
use crate::store::{DataResolver, Store};
use crate::types::{Data, Message, MessageFilter, MessageUpdate, RoutingKey};

/// Attempts at handing one message to a live processor
const ROUTE_ATTEMPTS: u32 = 3;

/// Messages assigned to one batch during a page
struct Assignment {
    batch_id: Uuid,
    messages: Vec<Uuid>,
}

/// What a page achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageOutcome {
    /// The page was full and processed to its end, so more may be waiting
    more: bool,
}

/// The resumable message sequencing loop
pub struct MessageSequencer {
    store: Arc<dyn Store>,
    resolver: Arc<dyn DataResolver>,
    dispatchers: Arc<DispatcherRegistry>,
    processors: Arc<ProcessorRegistry>,
    offsets: OffsetStore,
    /// Durable offset, last sequence below every unconfirmed message
    offset: i64,
    /// Last sequence read and routed
    cursor: i64,
    /// Routed messages whose batch is not confirmed yet, by sequence
    pending: BTreeMap<i64, Uuid>,
    confirmations: mpsc::UnboundedReceiver<Uuid>,
    published: watch::Sender<i64>,
    page_size: usize,
    poll_timeout: Duration,
    retry: Retry,
    cancel: CancellationToken,
    taps: Option<mpsc::Receiver<()>>,
}

impl MessageSequencer {
    /// `confirmations` carries the id of every batch the processors confirm
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<dyn DataResolver>,
        dispatchers: Arc<DispatcherRegistry>,
        processors: Arc<ProcessorRegistry>,
        confirmations: mpsc::UnboundedReceiver<Uuid>,
        config: &ManagerConfig,
        retry: Retry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            offsets: OffsetStore::new(store.clone()),
            store,
            resolver,
            dispatchers,
            processors,
            offset: 0,
            cursor: 0,
            pending: BTreeMap::new(),
            confirmations,
            published: watch::channel(0).0,
            page_size: config.read_page_size.max(1),
            poll_timeout: config.message_poll_timeout(),
            retry,
            cancel,
            taps: None,
        }
    }

    /// Resume after `offset`, publishing every committed offset on `published`
    pub fn starting_at(mut self, offset: i64, published: watch::Sender<i64>) -> Self {
        self.offset = offset;
        self.cursor = offset;
        published.send_replace(offset);
        self.published = published;
        self
    }

    /// Wake early when a shoulder tap arrives
    pub fn with_taps(mut self, taps: mpsc::Receiver<()>) -> Self {
        self.taps = Some(taps);
        self
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    fn confirm(&mut self, batch_id: Uuid) {
        self.pending.retain(|_, open| *open != batch_id);
    }

    fn drain_confirmations(&mut self) {
        while let Ok(batch_id) = self.confirmations.try_recv() {
            self.confirm(batch_id);
        }
    }

    /// Run until cancelled
    pub async fn run(mut self) {
        info!(offset = self.offset, "message sequencer started");
        let mut failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.process_page().await {
                Ok(PageOutcome { more: true }) => failures = 0,
                Ok(PageOutcome { more: false }) => {
                    failures = 0;
                    if !self.wait().await {
                        break;
                    }
                }
                Err(BatchError::Cancelled) => break,
                Err(err) => {
                    let delay = self.retry.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        cursor = self.cursor,
                        error = %err,
                        ?delay,
                        "message page failed, reading it again"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(offset = self.offset, "message sequencer stopped");
    }

    /// Wait for a tap, a batch confirmation or the poll timeout. Returns
    /// false once cancelled.
    async fn wait(&mut self) -> bool {
        let poll = tokio::time::sleep(self.poll_timeout);
        match self.taps.as_mut() {
            Some(taps) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                tap = taps.recv() => {
                    if tap.is_none() {
                        debug!("shoulder tap channel closed, polling only");
                        self.taps = None;
                    }
                    true
                }
                Some(batch_id) = self.confirmations.recv() => {
                    self.confirm(batch_id);
                    true
                }
                _ = poll => true,
            },
            None => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                Some(batch_id) = self.confirmations.recv() => {
                    self.confirm(batch_id);
                    true
                }
                _ = poll => true,
            },
        }
    }

    async fn process_page(&mut self) -> BatchResult<PageOutcome> {
        self.drain_confirmations();
        let filter = MessageFilter {
            after_sequence: self.cursor,
            limit: self.page_size,
        };
        let messages = self
            .store
            .get_messages(&filter)
            .await
            .map_err(BatchError::Store)?;
        if messages.is_empty() {
            self.commit_page(&[], &[], self.cursor).await?;
            return Ok(PageOutcome { more: false });
        }
        debug!(cursor = self.cursor, count = messages.len(), "read message page");

        let full = messages.len() >= self.page_size;
        let mut complete = true;
        let mut assignments: Vec<Assignment> = Vec::new();
        let mut open: Vec<(i64, Uuid)> = Vec::new();
        let mut last_assigned = None;

        for msg in &messages {
            if self.cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }

            if msg.batch.is_some() && msg.confirmed.is_some() {
                debug!(message_id = %msg.id(), sequence = msg.sequence, "message already batched");
                last_assigned = Some(msg.sequence);
                continue;
            }

            let data = match self.assemble_message_data(msg).await {
                Ok(data) => data,
                Err(BatchError::DataNotAvailable(id)) => {
                    debug!(message_id = %id, sequence = msg.sequence, "message data not yet available");
                    complete = false;
                    break;
                }
                Err(err) => {
                    warn!(message_id = %msg.id(), error = %err, "failed to resolve message data");
                    complete = false;
                    break;
                }
            };

            match self.dispatch_message(msg, data).await {
                Ok(batch_id) => {
                    match assignments.last_mut() {
                        Some(current) if current.batch_id == batch_id => {
                            current.messages.push(msg.id())
                        }
                        _ => assignments.push(Assignment {
                            batch_id,
                            messages: vec![msg.id()],
                        }),
                    }
                    open.push((msg.sequence, batch_id));
                    last_assigned = Some(msg.sequence);
                }
                Err(BatchError::NoDispatcher(msg_type)) => {
                    warn!(message_id = %msg.id(), %msg_type, "no dispatcher registered, skipping message");
                    last_assigned = Some(msg.sequence);
                }
                Err(err) => return Err(err),
            }
        }

        let cursor = last_assigned.unwrap_or(self.cursor);
        self.commit_page(&assignments, &open, cursor).await?;
        Ok(PageOutcome {
            more: full && complete,
        })
    }

    /// Resolve all data of a message, failing if any of it is missing
    async fn assemble_message_data(&self, msg: &Message) -> BatchResult<Vec<Data>> {
        let (data, complete) = self
            .resolver
            .resolve_message_data(msg, true)
            .await
            .map_err(BatchError::Store)?;
        if !complete {
            return Err(BatchError::DataNotAvailable(msg.id()));
        }
        Ok(data)
    }

    /// Route a message to its processor and wait for the open batch it joined.
    ///
    /// A processor holding a batch it failed to dispatch takes no new work
    /// until that batch goes out, so this wait stalls the whole loop for as
    /// long as the dispatcher keeps failing. Messages are never routed past
    /// one that has not been accepted, which keeps batches in sequence order.
    async fn dispatch_message(&self, msg: &Message, data: Vec<Data>) -> BatchResult<Uuid> {
        let entry = self.dispatchers.lookup(msg.header.msg_type)?;
        let key = RoutingKey::for_message(msg);

        let mut attempt = 1;
        loop {
            let (work, response) = BatchWork::new(msg.clone(), data.clone());
            self.processors.route(key.clone(), entry.clone(), work)?;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BatchError::Cancelled),
                response = response => response
                    .unwrap_or_else(|_| Err(BatchError::ProcessorDisposed(key.to_string()))),
            };
            match result {
                Err(BatchError::ProcessorDisposed(_))
                    if attempt < ROUTE_ATTEMPTS && !self.cancel.is_cancelled() =>
                {
                    debug!(key = %key, message_id = %msg.id(), attempt, "processor disposed during hand-off, routing again");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Mark the page's messages with their batches and move the offset, as one group.
    ///
    /// `open` lists the page's routed messages with their batch ids and
    /// `cursor` is the last sequence the page got through. The offset moves
    /// to just below the first message still waiting for its batch, or to
    /// `cursor` when there is none.
    async fn commit_page(
        &mut self,
        assignments: &[Assignment],
        open: &[(i64, Uuid)],
        cursor: i64,
    ) -> BatchResult<()> {
        let checkpoint = self
            .pending
            .keys()
            .copied()
            .chain(open.iter().map(|(sequence, _)| *sequence))
            .min()
            .map_or(cursor, |first_open| first_open - 1)
            .max(self.offset);
        let advance = checkpoint > self.offset;

        if !assignments.is_empty() || advance {
            let store = &self.store;
            let offsets = &self.offsets;
            self.retry
                .run(&self.cancel, "page commit", |_| async move {
                    store
                        .run_as_group(Box::pin(async move {
                            for assignment in assignments {
                                store
                                    .update_messages(
                                        &assignment.messages,
                                        &MessageUpdate::batched(assignment.batch_id),
                                    )
                                    .await?;
                            }
                            if advance {
                                offsets.update(checkpoint).await?;
                            }
                            Ok::<_, anyhow::Error>(())
                        }))
                        .await
                        .map_err(BatchError::from_group)
                })
                .await?;
        }

        self.cursor = cursor;
        self.pending.extend(open.iter().copied());
        if advance {
            debug!(
                from = self.offset,
                to = checkpoint,
                pending = self.pending.len(),
                "offset advanced"
            );
            self.offset = checkpoint;
            self.published.send_replace(checkpoint);
        }
        Ok(())
    }
}
