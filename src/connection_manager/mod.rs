//! Live connection state
//!
//! This module provides:
//! - Connection handles (one per open socket)
//! - The topic index (`channel:<id>`, `dm:<id>`, `user:<id>` → connections)
//! - The registry tying both together and emitting presence transitions
//! - Connection statistics

mod registry;
mod stats;
mod topic;
mod types;

pub use registry::{ConnectionRegistry, SubscribeOutcome};
pub use stats::{ConnectionStats, TopicCounts};
pub use topic::{SubscriptionIndex, TopicKey};
pub use types::{ConnectionHandle, OutboundMessage};
