//! Batch Manager Module
//!
//! The façade that owns the sequencer, the dispatcher registry and the live
//! batch processors.
//!
//! # Lifecycle
//! 1. Build with [`BatchManagerBuilder`], supplying the store and data resolver
//! 2. Register a dispatcher for every message type that should be batched
//! 3. [`start`](BatchManager::start) restores the offset and launches the
//!    background tasks
//! 4. Writers call [`notify_new_message`](BatchManager::notify_new_message)
//!    after storing a message
//! 5. [`close`](BatchManager::close) and
//!    [`wait_stopped`](BatchManager::wait_stopped) shut everything down

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{BatchError, BatchResult};
use crate::registry::{Dispatcher, DispatcherOptions, DispatcherRegistry, ProcessorRegistry};
use crate::retry::Retry;
use crate::sequencer::{MessageSequencer, NewMessageNotifier, OffsetStore, forward_notifications};
use crate::store::{DataResolver, Store};
use crate::types::MessageType;

/// Builder for [`BatchManager`]
pub struct BatchManagerBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    resolver: Option<Arc<dyn DataResolver>>,
}

impl BatchManagerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            resolver: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_data_resolver(mut self, resolver: Arc<dyn DataResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Create the manager
    ///
    /// # Returns
    /// * `Ok(BatchManager)` ready for dispatcher registration
    /// * `Err(BatchError::MissingDependency)` if the store or resolver is missing
    pub fn build(self) -> BatchResult<BatchManager> {
        let store = self.store.ok_or(BatchError::MissingDependency("store"))?;
        let resolver = self
            .resolver
            .ok_or(BatchError::MissingDependency("data resolver"))?;
        self.config.validate()?;

        let (notifier, notifications) =
            NewMessageNotifier::channel(self.config.manager.read_page_size);
        let (offset_tx, _) = watch::channel(0);

        Ok(BatchManager {
            retry: Retry::from(&self.config.retry),
            config: self.config,
            store,
            resolver,
            dispatchers: DispatcherRegistry::new(),
            processors: None,
            notifier,
            notifications: Some(notifications),
            offset_tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }
}

/// Sequencing and batching of outbound messages
pub struct BatchManager {
    config: Config,
    store: Arc<dyn Store>,
    resolver: Arc<dyn DataResolver>,
    /// Registrations collected before start
    dispatchers: DispatcherRegistry,
    /// Live processors, present once started
    processors: Option<Arc<ProcessorRegistry>>,
    retry: Retry,
    notifier: NewMessageNotifier,
    /// Receiving side of the notification queue, taken by the forwarder on start
    notifications: Option<mpsc::Receiver<i64>>,
    offset_tx: watch::Sender<i64>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl BatchManager {
    pub fn builder(config: Config) -> BatchManagerBuilder {
        BatchManagerBuilder::new(config)
    }

    fn is_started(&self) -> bool {
        self.processors.is_some()
    }

    /// Register `dispatcher` for `types` with the given batching policy
    ///
    /// # Returns
    /// * `Err(BatchError::AlreadyStarted)` after [`start`](Self::start)
    /// * `Err(BatchError::DuplicateDispatcher)` if a type is already registered
    pub fn register_dispatcher(
        &mut self,
        types: &[MessageType],
        dispatcher: Arc<dyn Dispatcher>,
        options: DispatcherOptions,
    ) -> BatchResult<()> {
        if self.is_started() {
            return Err(BatchError::AlreadyStarted);
        }
        self.dispatchers.register(types, dispatcher, options)?;
        debug!(?types, "dispatcher registered");
        Ok(())
    }

    /// Restore the offset and start the background tasks
    ///
    /// Restoring is retried up to `manager.startup_retry_attempts` times; if
    /// it still fails the error is returned and nothing is started.
    pub async fn start(&mut self) -> BatchResult<()> {
        if self.is_started() {
            return Err(BatchError::AlreadyStarted);
        }

        let offsets = OffsetStore::new(self.store.clone());
        let startup = self
            .retry
            .with_max_attempts(self.config.manager.startup_retry_attempts.max(1));
        let offset = startup
            .run(&self.cancel, "offset restore", |_| {
                let offsets = offsets.clone();
                async move { offsets.restore().await }
            })
            .await?;

        let Some(notifications) = self.notifications.take() else {
            return Err(BatchError::AlreadyStarted);
        };
        let dispatchers = Arc::new(std::mem::take(&mut self.dispatchers));
        let (confirmed_tx, confirmed_rx) = mpsc::unbounded_channel();
        let processors = Arc::new(ProcessorRegistry::new(
            self.store.clone(),
            self.retry.clone(),
            self.cancel.clone(),
            self.tracker.clone(),
            confirmed_tx,
        ));
        self.processors = Some(processors.clone());

        let (taps_tx, taps_rx) = mpsc::channel(1);
        self.tracker.spawn(forward_notifications(
            notifications,
            taps_tx,
            self.cancel.clone(),
        ));

        let sequencer = MessageSequencer::new(
            self.store.clone(),
            self.resolver.clone(),
            dispatchers.clone(),
            processors,
            confirmed_rx,
            &self.config.manager,
            self.retry.clone(),
            self.cancel.clone(),
        )
        .starting_at(offset, self.offset_tx.clone())
        .with_taps(taps_rx);
        self.tracker.spawn(sequencer.run());

        info!(
            offset,
            dispatchers = dispatchers.len(),
            page_size = self.config.manager.read_page_size,
            "batch manager started"
        );
        Ok(())
    }

    /// Tell the sequencer a message with `sequence` was stored. Never blocks.
    pub fn notify_new_message(&self, sequence: i64) {
        self.notifier.notify(sequence);
    }

    /// A handle writers can keep to notify without holding the manager
    pub fn notifier(&self) -> NewMessageNotifier {
        self.notifier.clone()
    }

    /// Stop the sequencer and all processors
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!("batch manager closing");
        }
        self.cancel.cancel();
        self.tracker.close();
    }

    /// Wait until every background task has exited
    pub async fn wait_stopped(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        debug!("batch manager stopped");
    }

    /// Last committed offset
    pub fn current_offset(&self) -> i64 {
        *self.offset_tx.borrow()
    }

    /// Watch the committed offset as it advances
    pub fn offset_watcher(&self) -> watch::Receiver<i64> {
        self.offset_tx.subscribe()
    }

    /// Number of live batch processors
    pub fn active_processors(&self) -> usize {
        self.processors.as_ref().map_or(0, |p| p.active())
    }
}

impl Drop for BatchManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests;
