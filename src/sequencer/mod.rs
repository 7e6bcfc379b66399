//! Sequencer Module
//!
//! This module drives messages from the store into batch processors:
//! - MessageSequencer: The polling loop that reads, resolves and routes messages
//! - OffsetStore: The durable checkpoint the loop resumes from
//! - NewMessageNotifier: Non-blocking shoulder taps from message writers

mod offset;
mod sequencer;
mod tap;


pub use offset::OffsetStore;
pub use sequencer::MessageSequencer;
pub use tap::{NewMessageNotifier, forward_notifications};
