//! Batch Trigger Module
//!
//! Decides when an open batch is sealed:
//! - Size trigger: the buffer reached the configured maximum
//! - Time trigger: the batch timeout elapsed since the batch opened

use std::time::Duration;

use tokio::time::Instant;

use crate::registry::DispatcherOptions;

/// Size and time limits of an open batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealTrigger {
    /// Seal once this many messages are buffered (at least 1)
    pub threshold: usize,
    /// Seal a partial batch this long after it opened
    pub timeout: Duration,
}

impl SealTrigger {
    /// Limits for a registration's policy
    ///
    /// A zero size or a zero timeout both seal every message on its own.
    pub fn new(options: &DispatcherOptions) -> Self {
        let threshold = if options.batch_timeout.is_zero() {
            1
        } else {
            options.batch_max_size.max(1)
        };
        Self {
            threshold,
            timeout: options.batch_timeout,
        }
    }

    pub fn is_full(&self, len: usize) -> bool {
        len >= self.threshold
    }

    /// When a batch opened at `opened` must be sealed
    pub fn deadline(&self, opened: Instant) -> Instant {
        opened + self.timeout
    }
}
