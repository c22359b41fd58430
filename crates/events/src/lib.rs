//! Broker and channel mechanics (transport-agnostic).
//!
//! - `broker`: the publish/subscribe boundary the pipeline consumes
//! - `in_memory_broker`: a process-local broker for tests/dev
//! - `channel`: bounded queues that shed load instead of blocking producers

pub mod broker;
pub mod channel;
pub mod in_memory_broker;

pub use broker::{Broker, BrokerError, MessageHandler};
pub use channel::{ChannelReceiver, ChannelSender, Offer, bounded};
pub use in_memory_broker::InMemoryBroker;
