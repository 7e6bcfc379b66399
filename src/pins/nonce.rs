use crate::error::{BatchError, BatchResult};
use crate::store::Store;
use crate::types::Bytes32;

/// Hands out strictly increasing nonces per `(context, author)`
///
/// The counter lives in the store; each call is one atomic
/// fetch-and-increment, so allocators in different processes never hand out
/// the same value.
pub struct NonceAllocator<'a> {
    store: &'a dyn Store,
}

impl<'a> NonceAllocator<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Next nonce for `author` under the private context `context_key`
    pub async fn next(&self, context_key: &[u8], author: &str) -> BatchResult<i64> {
        let context = Bytes32::sha256(context_key);
        self.store
            .upsert_nonce_next(&context, author)
            .await
            .map_err(BatchError::Store)
    }
}
