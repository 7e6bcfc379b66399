//! Registry Module
//!
//! Lookup tables the sequencer routes through:
//! - DispatcherRegistry: fixed map from message type to the dispatcher and
//!   batching policy registered for it, frozen when the manager starts
//! - ProcessorRegistry: the live batch processor for each routing key

mod dispatchers;
mod processors;

pub use dispatchers::{Dispatcher, DispatcherEntry, DispatcherOptions, DispatcherRegistry};
pub use processors::ProcessorRegistry;
