//! Store Module
//!
//! The batch manager does not own persistence. It talks to the store and to
//! the data-resolution service through the traits defined here:
//! - [`Store`]: message / batch / offset / nonce access plus `run_as_group`,
//!   the unit-of-work primitive every cross-entity update goes through
//! - [`DataResolver`]: resolves a message's data references to payloads
//!
//! [`MemoryStore`] implements both in memory, with rollback for failed groups.

mod memory;

pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::types::{
    Batch, BatchUpdate, Bytes32, Data, Message, MessageFilter, MessageUpdate, Offset, OffsetType,
};

/// Work executed by [`Store::run_as_group`]; an error aborts the whole group
pub type GroupWork<'a> = BoxFuture<'a, Result<()>>;

/// Persistence used by the batch manager
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_offset(
        &self,
        offset_type: OffsetType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Offset>>;

    /// Insert an offset, or overwrite it when `allow_existing` is set
    async fn upsert_offset(&self, offset: &Offset, allow_existing: bool) -> Result<()>;

    async fn update_offset(
        &self,
        offset_type: OffsetType,
        namespace: &str,
        name: &str,
        current: i64,
    ) -> Result<()>;

    /// Messages with a sequence above `filter.after_sequence`, ascending
    async fn get_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>>;

    async fn update_messages(&self, ids: &[Uuid], update: &MessageUpdate) -> Result<()>;

    /// Insert a batch, or overwrite it when `allow_existing` is set
    async fn upsert_batch(&self, batch: &Batch, allow_existing: bool) -> Result<()>;

    async fn update_batch(&self, id: &Uuid, update: &BatchUpdate) -> Result<()>;

    /// Return the next unused nonce for `(context, author)` and advance it.
    ///
    /// Must be atomic across processes: the first call for a pair returns 0
    /// and every later call returns one more than the previous.
    async fn upsert_nonce_next(&self, context: &Bytes32, author: &str) -> Result<i64>;

    /// Run `work` as one transaction. Calls made by `work` on this store
    /// commit together, or not at all if `work` fails.
    async fn run_as_group<'a>(&'a self, work: GroupWork<'a>) -> Result<()>;
}

/// Resolves the data referenced by a message
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataResolver: Send + Sync {
    /// Returns the resolved data and whether every reference was found.
    async fn resolve_message_data(
        &self,
        msg: &Message,
        with_value: bool,
    ) -> Result<(Vec<Data>, bool)>;
}
