use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DispatcherConfig;
use crate::error::{BatchError, BatchResult};
use crate::types::{Batch, Bytes32, MessageType};

/// Transmits a sealed batch to other parties
///
/// Called inside the store group that confirms the batch: an error rolls
/// back the confirmation and the nonces allocated for `contexts`, and the
/// dispatch is retried later. The dispatcher may record where it put the
/// payload in `batch.payload_ref`.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, batch: &mut Batch, contexts: &[Bytes32]) -> anyhow::Result<()>;
}

/// Batching policy of one registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherOptions {
    pub batch_max_size: usize,
    pub batch_timeout: Duration,
    pub dispose_timeout: Duration,
}

impl From<&DispatcherConfig> for DispatcherOptions {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            batch_max_size: config.batch_max_size,
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
            dispose_timeout: Duration::from_millis(config.dispose_timeout_ms),
        }
    }
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

/// A registered dispatcher together with its policy
pub struct DispatcherEntry {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub options: DispatcherOptions,
}

/// Message type to dispatcher lookup
#[derive(Default)]
pub struct DispatcherRegistry {
    entries: HashMap<MessageType, Arc<DispatcherEntry>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `dispatcher` for every type in `types`.
    ///
    /// Fails without registering anything if one of the types is already
    /// claimed.
    pub fn register(
        &mut self,
        types: &[MessageType],
        dispatcher: Arc<dyn Dispatcher>,
        options: DispatcherOptions,
    ) -> BatchResult<()> {
        if let Some(taken) = types.iter().find(|t| self.entries.contains_key(t)) {
            return Err(BatchError::DuplicateDispatcher(*taken));
        }
        let entry = Arc::new(DispatcherEntry {
            dispatcher,
            options,
        });
        for msg_type in types {
            self.entries.insert(*msg_type, entry.clone());
        }
        Ok(())
    }

    pub fn lookup(&self, msg_type: MessageType) -> BatchResult<Arc<DispatcherEntry>> {
        self.entries
            .get(&msg_type)
            .cloned()
            .ok_or(BatchError::NoDispatcher(msg_type))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl Dispatcher for Nop {
        async fn dispatch(&self, _: &mut Batch, _: &[Bytes32]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_finds_every_registered_type() {
        let mut registry = DispatcherRegistry::new();
        registry
            .register(
                &[MessageType::Broadcast, MessageType::Definition],
                Arc::new(Nop),
                DispatcherOptions::default(),
            )
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup(MessageType::Definition).is_ok());
        assert!(matches!(
            registry.lookup(MessageType::Private),
            Err(BatchError::NoDispatcher(MessageType::Private))
        ));
    }

    #[test]
    fn overlapping_registration_is_rejected_whole() {
        let mut registry = DispatcherRegistry::new();
        registry
            .register(&[MessageType::Broadcast], Arc::new(Nop), DispatcherOptions::default())
            .unwrap();
        let err = registry
            .register(
                &[MessageType::Private, MessageType::Broadcast],
                Arc::new(Nop),
                DispatcherOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, BatchError::DuplicateDispatcher(MessageType::Broadcast)));
        assert!(registry.lookup(MessageType::Private).is_err());
    }

    #[test]
    fn options_follow_config_units() {
        let options = DispatcherOptions::from(&DispatcherConfig {
            batch_max_size: 3,
            batch_timeout_ms: 1500,
            dispose_timeout_ms: 0,
        });
        assert_eq!(options.batch_timeout, Duration::from_millis(1500));
        assert_eq!(options.dispose_timeout, Duration::ZERO);
    }
}
