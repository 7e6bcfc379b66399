//! In-memory store
//!
//! Keeps every entity in maps behind one read-write lock. Groups are
//! serialized by a separate mutex and journal the previous value of
//! everything they write, so a failed group can be rolled back without
//! touching writes made by other tasks in the meantime.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{DataResolver, GroupWork, Store};
use crate::types::{
    Batch, BatchUpdate, Bytes32, Data, Message, MessageFilter, MessageUpdate, Offset, OffsetType,
};

type OffsetKey = (OffsetType, String, String);
type NonceKey = (Bytes32, String);

/// Previous value of a record written inside a group
enum Undo {
    Message(i64, Message),
    Batch(Uuid, Option<Batch>),
    Offset(OffsetKey, Option<Offset>),
    Nonce(NonceKey, Option<i64>),
}

tokio::task_local! {
    static JOURNAL: Arc<StdMutex<Vec<Undo>>>;
}

fn record(undo: Undo) {
    let _ = JOURNAL.try_with(|journal| {
        if let Ok(mut entries) = journal.lock() {
            entries.push(undo);
        }
    });
}

fn in_group() -> bool {
    JOURNAL.try_with(|_| ()).is_ok()
}

#[derive(Default)]
struct MemoryState {
    messages: BTreeMap<i64, Message>,
    message_index: HashMap<Uuid, i64>,
    data: HashMap<Uuid, Data>,
    batches: HashMap<Uuid, Batch>,
    offsets: HashMap<OffsetKey, Offset>,
    nonces: HashMap<NonceKey, i64>,
    last_sequence: i64,
}

impl MemoryState {
    fn undo(&mut self, entry: Undo) {
        match entry {
            Undo::Message(seq, msg) => {
                self.messages.insert(seq, msg);
            }
            Undo::Batch(id, Some(batch)) => {
                self.batches.insert(id, batch);
            }
            Undo::Batch(id, None) => {
                self.batches.remove(&id);
            }
            Undo::Offset(key, Some(offset)) => {
                self.offsets.insert(key, offset);
            }
            Undo::Offset(key, None) => {
                self.offsets.remove(&key);
            }
            Undo::Nonce(key, Some(next)) => {
                self.nonces.insert(key, next);
            }
            Undo::Nonce(key, None) => {
                self.nonces.remove(&key);
            }
        }
    }
}

/// Store and data resolver backed by process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    group: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, assigning it the next sequence number
    pub async fn insert_message(&self, mut msg: Message) -> i64 {
        let mut state = self.state.write().await;
        state.last_sequence += 1;
        let sequence = state.last_sequence;
        msg.sequence = sequence;
        state.message_index.insert(msg.header.id, sequence);
        state.messages.insert(sequence, msg);
        sequence
    }

    pub async fn insert_data(&self, data: Data) {
        self.state.write().await.data.insert(data.id, data);
    }

    pub async fn message(&self, id: &Uuid) -> Option<Message> {
        let state = self.state.read().await;
        let seq = state.message_index.get(id)?;
        state.messages.get(seq).cloned()
    }

    pub async fn batch(&self, id: &Uuid) -> Option<Batch> {
        self.state.read().await.batches.get(id).cloned()
    }

    pub async fn batches(&self) -> Vec<Batch> {
        self.state.read().await.batches.values().cloned().collect()
    }

    /// Seed the next nonce handed out for `(context, author)`
    pub async fn set_nonce(&self, context: Bytes32, author: &str, next: i64) {
        self.state
            .write()
            .await
            .nonces
            .insert((context, author.to_string()), next);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_offset(
        &self,
        offset_type: OffsetType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Offset>> {
        let key = (offset_type, namespace.to_string(), name.to_string());
        Ok(self.state.read().await.offsets.get(&key).cloned())
    }

    async fn upsert_offset(&self, offset: &Offset, allow_existing: bool) -> Result<()> {
        let key = (
            offset.offset_type,
            offset.namespace.clone(),
            offset.name.clone(),
        );
        let mut state = self.state.write().await;
        let previous = state.offsets.get(&key).cloned();
        if previous.is_some() && !allow_existing {
            bail!("offset '{}' already exists", offset.name);
        }
        state.offsets.insert(key.clone(), offset.clone());
        record(Undo::Offset(key, previous));
        Ok(())
    }

    async fn update_offset(
        &self,
        offset_type: OffsetType,
        namespace: &str,
        name: &str,
        current: i64,
    ) -> Result<()> {
        let key = (offset_type, namespace.to_string(), name.to_string());
        let mut state = self.state.write().await;
        let offset = state
            .offsets
            .get_mut(&key)
            .ok_or_else(|| anyhow!("offset '{name}' not found"))?;
        let previous = offset.clone();
        offset.current = current;
        record(Undo::Offset(key, Some(previous)));
        Ok(())
    }

    async fn get_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .range((Bound::Excluded(filter.after_sequence), Bound::Unbounded))
            .take(filter.limit)
            .map(|(_, msg)| msg.clone())
            .collect())
    }

    async fn update_messages(&self, ids: &[Uuid], update: &MessageUpdate) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            let Some(seq) = state.message_index.get(id).copied() else {
                continue;
            };
            if let Some(msg) = state.messages.get_mut(&seq) {
                record(Undo::Message(seq, msg.clone()));
                if let Some(batch) = update.batch {
                    msg.batch = Some(batch);
                }
                if let Some(confirmed) = update.confirmed {
                    msg.confirmed = Some(confirmed);
                }
            }
        }
        Ok(())
    }

    async fn upsert_batch(&self, batch: &Batch, allow_existing: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let previous = state.batches.get(&batch.id).cloned();
        if previous.is_some() && !allow_existing {
            bail!("batch {} already exists", batch.id);
        }
        state.batches.insert(batch.id, batch.clone());
        record(Undo::Batch(batch.id, previous));
        Ok(())
    }

    async fn update_batch(&self, id: &Uuid, update: &BatchUpdate) -> Result<()> {
        let mut state = self.state.write().await;
        let batch = state
            .batches
            .get_mut(id)
            .ok_or_else(|| anyhow!("batch {id} not found"))?;
        let previous = batch.clone();
        if let Some(payload) = &update.payload {
            batch.payload = payload.clone();
        }
        if let Some(hash) = update.hash {
            batch.hash = Some(hash);
        }
        if let Some(payload_ref) = &update.payload_ref {
            batch.payload_ref = Some(payload_ref.clone());
        }
        if let Some(confirmed) = update.confirmed {
            batch.confirmed = Some(confirmed);
        }
        record(Undo::Batch(*id, Some(previous)));
        Ok(())
    }

    async fn upsert_nonce_next(&self, context: &Bytes32, author: &str) -> Result<i64> {
        let key = (*context, author.to_string());
        let mut state = self.state.write().await;
        let previous = state.nonces.get(&key).copied();
        let nonce = previous.unwrap_or(0);
        state.nonces.insert(key.clone(), nonce + 1);
        record(Undo::Nonce(key, previous));
        Ok(nonce)
    }

    async fn run_as_group<'a>(&'a self, work: GroupWork<'a>) -> Result<()> {
        // A nested group joins the one already running on this task
        if in_group() {
            return work.await;
        }

        let _serialized = self.group.lock().await;
        let journal = Arc::new(StdMutex::new(Vec::new()));
        let result = JOURNAL.scope(journal.clone(), work).await;
        if result.is_err() {
            let entries = match journal.lock() {
                Ok(mut entries) => std::mem::take(&mut *entries),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            let mut state = self.state.write().await;
            for entry in entries.into_iter().rev() {
                state.undo(entry);
            }
        }
        result
    }
}

#[async_trait]
impl DataResolver for MemoryStore {
    async fn resolve_message_data(
        &self,
        msg: &Message,
        with_value: bool,
    ) -> Result<(Vec<Data>, bool)> {
        let state = self.state.read().await;
        let mut found = Vec::with_capacity(msg.data.len());
        for data_ref in &msg.data {
            match state.data.get(&data_ref.id) {
                Some(data) if with_value => found.push(data.clone()),
                Some(data) => found.push(Data {
                    value: serde_json::Value::Null,
                    ..data.clone()
                }),
                None => return Ok((found, false)),
            }
        }
        Ok((found, true))
    }
}
