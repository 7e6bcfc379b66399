//! Pin Contexts
//!
//! Every dispatched batch is pinned under one or more 32 byte contexts that
//! let other parties order batches without learning their topics:
//! - broadcast-class batches pin each distinct topic as `SHA256(topic)`
//! - private-class batches pin each topic of the lead message with a
//!   per-author nonce inside the recipient group, so consecutive pins of the
//!   same topic cannot be linked by outsiders

mod context;
mod nonce;

pub use context::{broadcast_context, distinct_topics, private_context_key, private_pin};
pub use nonce::NonceAllocator;

use tracing::debug;

use crate::error::{BatchError, BatchResult};
use crate::store::Store;
use crate::types::{Batch, Bytes32};

/// Derive the pin contexts for a sealed batch.
///
/// Private batches allocate one nonce per topic, so this must run inside the
/// same store group that records the dispatch; a rollback then releases the
/// nonces again.
pub async fn batch_contexts(store: &dyn Store, batch: &Batch) -> BatchResult<Vec<Bytes32>> {
    let messages = &batch.payload.messages;

    if !batch.batch_type.is_private() {
        let topics = distinct_topics(messages.iter().flat_map(|m| m.header.topics.iter()));
        return Ok(topics.into_iter().map(broadcast_context).collect());
    }

    let group = batch.group.ok_or(BatchError::MissingGroup(batch.id))?;
    let Some(lead) = messages.first() else {
        return Ok(Vec::new());
    };

    let allocator = NonceAllocator::new(store);
    let mut contexts = Vec::with_capacity(lead.header.topics.len());
    for topic in distinct_topics(lead.header.topics.iter()) {
        let key = private_context_key(topic, &group);
        let nonce = allocator.next(&key, &batch.author).await?;
        debug!(batch_id = %batch.id, topic, nonce, "allocated private pin nonce");
        contexts.push(private_pin(topic, &group, &batch.author, nonce));
    }
    Ok(contexts)
}
