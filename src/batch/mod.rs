//! Batch Module
//!
//! This module turns routed messages into dispatched batches:
//! - BatchAssembler: Accumulates messages into an open batch and seals it
//! - SealTrigger: Decides when an open batch is sealed (size or timeout)
//! - BatchProcessor: Per routing key task owning an assembler and driving
//!   dispatch

mod assembler;
mod processor;
mod trigger;

pub use assembler::{AddOutcome, BatchAssembler};
pub use processor::{BatchProcessor, BatchWork, ProcessorState, dispatch_sealed};
pub use trigger::SealTrigger;
