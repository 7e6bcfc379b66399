//! Shared fixtures for the unit tests

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::{Dispatcher, DispatcherOptions};
use crate::retry::Retry;
use crate::store::{GroupWork, MemoryStore, Store};
use crate::types::{
    Batch, BatchUpdate, Bytes32, Message, MessageFilter, MessageType, MessageUpdate, Offset,
    OffsetType,
};

pub const AUTHOR: &str = "0x12345";
pub const GROUP_HEX: &str = "44dc0861e69d9bab17dd5e90a8898c2ea156ad04e5fabf83119cc010486e6c1b";

pub fn group() -> Bytes32 {
    Bytes32::from_hex(GROUP_HEX).unwrap()
}

pub fn broadcast(topics: &[&str]) -> Message {
    Message::new(
        MessageType::Broadcast,
        "ns1",
        AUTHOR,
        topics.iter().map(|t| t.to_string()).collect(),
    )
}

pub fn private(topics: &[&str]) -> Message {
    Message::new(
        MessageType::Private,
        "ns1",
        AUTHOR,
        topics.iter().map(|t| t.to_string()).collect(),
    )
    .with_group(group())
}

pub fn quick_retry(max_attempts: u32) -> Retry {
    Retry {
        initial_delay: Duration::from_millis(1),
        maximum_delay: Duration::from_millis(5),
        factor: 2.0,
        max_attempts,
    }
}

pub fn options(
    batch_max_size: usize,
    batch_timeout_ms: u64,
    dispose_timeout_ms: u64,
) -> DispatcherOptions {
    DispatcherOptions {
        batch_max_size,
        batch_timeout: Duration::from_millis(batch_timeout_ms),
        dispose_timeout: Duration::from_millis(dispose_timeout_ms),
    }
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Store wrapper that records calls and fails them on demand
pub struct FaultyStore {
    inner: MemoryStore,
    faults: Mutex<HashMap<&'static str, u32>>,
    calls: Mutex<Vec<&'static str>>,
    filters: Mutex<Vec<MessageFilter>>,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next `times` calls of `op` (`u32::MAX` for always)
    pub fn fail(&self, op: &'static str, times: u32) {
        self.faults.lock().unwrap().insert(op, times);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
    }

    pub fn filters(&self) -> Vec<MessageFilter> {
        self.filters.lock().unwrap().clone()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn enter(&self, op: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(op);
        let mut faults = self.faults.lock().unwrap();
        if let Some(remaining) = faults.get_mut(op) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                bail!("injected {op} failure");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn get_offset(
        &self,
        offset_type: OffsetType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Offset>> {
        self.enter("get_offset")?;
        self.inner.get_offset(offset_type, namespace, name).await
    }

    async fn upsert_offset(&self, offset: &Offset, allow_existing: bool) -> Result<()> {
        self.enter("upsert_offset")?;
        self.inner.upsert_offset(offset, allow_existing).await
    }

    async fn update_offset(
        &self,
        offset_type: OffsetType,
        namespace: &str,
        name: &str,
        current: i64,
    ) -> Result<()> {
        self.enter("update_offset")?;
        self.inner
            .update_offset(offset_type, namespace, name, current)
            .await
    }

    async fn get_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        self.enter("get_messages")?;
        self.filters.lock().unwrap().push(filter.clone());
        self.inner.get_messages(filter).await
    }

    async fn update_messages(&self, ids: &[Uuid], update: &MessageUpdate) -> Result<()> {
        self.enter("update_messages")?;
        self.inner.update_messages(ids, update).await
    }

    async fn upsert_batch(&self, batch: &Batch, allow_existing: bool) -> Result<()> {
        self.enter("upsert_batch")?;
        self.inner.upsert_batch(batch, allow_existing).await
    }

    async fn update_batch(&self, id: &Uuid, update: &BatchUpdate) -> Result<()> {
        self.enter("update_batch")?;
        self.inner.update_batch(id, update).await
    }

    async fn upsert_nonce_next(&self, context: &Bytes32, author: &str) -> Result<i64> {
        self.enter("upsert_nonce_next")?;
        self.inner.upsert_nonce_next(context, author).await
    }

    async fn run_as_group<'a>(&'a self, work: GroupWork<'a>) -> Result<()> {
        self.enter("run_as_group")?;
        self.inner.run_as_group(work).await
    }
}

/// A batch as seen by [`RecordingDispatcher`]
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub batch: Batch,
    pub contexts: Vec<Bytes32>,
}

/// Dispatcher that reports every batch on a channel
pub struct RecordingDispatcher {
    failures: AtomicU32,
    tx: mpsc::UnboundedSender<Dispatched>,
}

impl RecordingDispatcher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Dispatched>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            failures: AtomicU32::new(0),
            tx,
        });
        (dispatcher, rx)
    }

    /// Refuse the next `n` dispatches
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, batch: &mut Batch, contexts: &[Bytes32]) -> Result<()> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            bail!("dispatch refused");
        }
        batch.payload_ref = Some(format!("ref-{}", batch.id));
        let _ = self.tx.send(Dispatched {
            batch: batch.clone(),
            contexts: contexts.to_vec(),
        });
        Ok(())
    }
}

/// Next dispatched batch, failing the test after five seconds
pub async fn next_dispatch(rx: &mut mpsc::UnboundedReceiver<Dispatched>) -> Dispatched {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a dispatch")
        .expect("dispatcher dropped")
}
