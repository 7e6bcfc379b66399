//! This crate implements the sequencing and batching core of a multi-party
//! messaging system. Outbound messages are read in sequence order from a store,
//! grouped into batches per namespace, type and recipient group, pinned under
//! content-hiding contexts, and handed to pluggable dispatchers.

pub mod types; // Messages, batches, offsets and the hashes that identify them.
pub mod error; // Crate error type.
pub mod config; // Defines and loads configuration.
pub mod retry; // Exponential backoff for store and dispatch calls.
pub mod store; // Store and data resolver traits, plus the in-memory store.
pub mod pins; // Pin context derivation and nonce allocation.
pub mod registry; // Dispatcher registrations and live batch processors.
pub mod batch; // Batch assembly, sealing and dispatch.
pub mod sequencer; // The resumable message sequencing loop.
pub mod manager; // Façade tying everything together.

#[cfg(test)]
mod test_utils;

// Re-export commonly used types for easier access.
pub use types::*;
pub use config::Config;
pub use error::{BatchError, BatchResult};
pub use manager::{BatchManager, BatchManagerBuilder};
pub use registry::{Dispatcher, DispatcherOptions};
pub use store::{DataResolver, MemoryStore, Store};
