use std::sync::Arc;

use tracing::info;

use crate::error::{BatchError, BatchResult};
use crate::store::Store;
use crate::types::{MSG_BATCH_OFFSET_NAME, Offset, OffsetType, SYSTEM_NAMESPACE};

/// The sequencer's checkpoint record
///
/// Stores the sequence of the last message that was assigned to a batch.
/// Reading resumes strictly after it.
#[derive(Clone)]
pub struct OffsetStore {
    store: Arc<dyn Store>,
}

impl OffsetStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Read the checkpoint, creating it at zero on first run
    pub async fn restore(&self) -> BatchResult<i64> {
        if let Some(offset) = self.read().await? {
            info!(offset = offset.current, "restored message batch offset");
            return Ok(offset.current);
        }

        let initial = Offset {
            offset_type: OffsetType::Batch,
            namespace: SYSTEM_NAMESPACE.to_string(),
            name: MSG_BATCH_OFFSET_NAME.to_string(),
            current: 0,
        };
        self.store
            .upsert_offset(&initial, true)
            .await
            .map_err(BatchError::Store)?;

        match self.read().await? {
            Some(offset) => {
                info!(offset = offset.current, "created message batch offset");
                Ok(offset.current)
            }
            None => Err(BatchError::OffsetNotFound(MSG_BATCH_OFFSET_NAME.to_string())),
        }
    }

    pub async fn update(&self, current: i64) -> BatchResult<()> {
        self.store
            .update_offset(OffsetType::Batch, SYSTEM_NAMESPACE, MSG_BATCH_OFFSET_NAME, current)
            .await
            .map_err(BatchError::Store)
    }

    async fn read(&self) -> BatchResult<Option<Offset>> {
        self.store
            .get_offset(OffsetType::Batch, SYSTEM_NAMESPACE, MSG_BATCH_OFFSET_NAME)
            .await
            .map_err(BatchError::Store)
    }
}
