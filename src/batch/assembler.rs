//! Batch Assembler Module
//!
//! Accumulates the messages routed to one processor into an in-flight batch
//! and seals it into its final, hashed form.

use std::collections::HashSet;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{BatchError, BatchResult};
use crate::types::{
    Batch, BatchPayload, Data, Message, RoutingKey, TransactionRef, TransactionType,
};

/// Result of adding a message to the assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The message opened a new in-flight batch
    Opened,
    /// The message joined the open batch
    Appended,
    /// The message was already in the open batch
    Duplicate,
}

/// In-flight batch builder for one routing key
///
/// The batch id and its parent transaction id are fixed when the first
/// message arrives, so the sequencer can record the assignment before the
/// batch is sealed.
pub struct BatchAssembler {
    /// Routing key all added messages share
    key: RoutingKey,
    /// Open batch, `None` while empty
    inflight: Option<Batch>,
    /// Ids of the messages in the open batch
    members: HashSet<Uuid>,
    /// Length of the data list before each message was added
    data_marks: Vec<usize>,
}

impl BatchAssembler {
    pub fn new(key: RoutingKey) -> Self {
        Self {
            key,
            inflight: None,
            members: HashSet::new(),
            data_marks: Vec::new(),
        }
    }

    /// Add a message and its resolved data
    ///
    /// Data items already carried by the batch are not repeated.
    ///
    /// # Returns
    /// Whether the message opened the batch, joined it, or was already part of it
    pub fn add(&mut self, message: Message, data: Vec<Data>) -> AddOutcome {
        if !self.members.insert(message.id()) {
            return AddOutcome::Duplicate;
        }

        let (outcome, mut batch) = match self.inflight.take() {
            Some(batch) => (AddOutcome::Appended, batch),
            None => (AddOutcome::Opened, self.open(&message)),
        };

        self.data_marks.push(batch.payload.data.len());
        for item in data {
            if !batch.payload.data.iter().any(|d| d.id == item.id) {
                batch.payload.data.push(item);
            }
        }
        batch.payload.messages.push(message);
        self.inflight = Some(batch);
        outcome
    }

    fn open(&self, lead: &Message) -> Batch {
        Batch {
            id: Uuid::new_v4(),
            namespace: self.key.namespace.clone(),
            batch_type: self.key.msg_type,
            author: lead.header.author.clone(),
            group: self.key.group,
            hash: None,
            created: Utc::now(),
            confirmed: None,
            payload: BatchPayload {
                tx: TransactionRef {
                    tx_type: TransactionType::BatchPin,
                    id: Uuid::new_v4(),
                },
                messages: Vec::new(),
                data: Vec::new(),
            },
            payload_ref: None,
        }
    }

    /// Take back the most recently added message
    ///
    /// Used when recording the add failed. Removing the only message closes
    /// the batch again.
    pub fn undo_last(&mut self) {
        let Some(batch) = self.inflight.as_mut() else {
            return;
        };
        if let Some(message) = batch.payload.messages.pop() {
            self.members.remove(&message.id());
        }
        if let Some(mark) = self.data_marks.pop() {
            batch.payload.data.truncate(mark);
        }
        if batch.payload.messages.is_empty() {
            self.reset();
        }
    }

    /// Build the sealed form of the open batch
    ///
    /// The open batch is left in place until [`reset`](Self::reset), so a
    /// failed dispatch can be sealed and tried again.
    ///
    /// # Returns
    /// * `Ok(Some(batch))` with the payload hash filled in
    /// * `Ok(None)` if nothing is buffered
    /// * `Err` if the payload cannot be encoded or a private batch has no group
    pub fn seal(&self) -> BatchResult<Option<Batch>> {
        let Some(open) = &self.inflight else {
            return Ok(None);
        };
        if open.batch_type.is_private() && open.group.is_none() {
            return Err(BatchError::MissingGroup(open.id));
        }
        let mut sealed = open.clone();
        sealed.hash = Some(sealed.payload.hash()?);
        Ok(Some(sealed))
    }

    /// Drop the open batch
    pub fn reset(&mut self) {
        self.inflight = None;
        self.members.clear();
        self.data_marks.clear();
    }

    pub fn inflight(&self) -> Option<&Batch> {
        self.inflight.as_ref()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
