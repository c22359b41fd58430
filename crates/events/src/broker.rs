//! Broker boundary (mechanics only).
//!
//! The upstream broker publishes vehicle positions under hierarchical topic names.
//! The pipeline only needs two things from it:
//!
//! - **Filter management**: `subscribe` / `unsubscribe` a [`TopicFilter`]
//! - **Delivery**: one [`MessageHandler::on_message`] call per received message
//!
//! ## Delivery Guarantees
//!
//! Whatever the backing transport provides. The MQTT backend subscribes at QoS 0
//! (at-most-once), which matches a live telemetry feed where the next update
//! supersedes the last one.
//!
//! ## Callback Discipline
//!
//! `on_message` runs on the broker's delivery context. Implementations must not
//! perform blocking I/O there: decode, hand off through a channel, return.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use geobus_core::TopicFilter;

/// Broker operation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker connection is down or the request could not be queued.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the filter.
    #[error("broker rejected filter '{filter}': {reason}")]
    Rejected { filter: String, reason: String },
}

/// Subscription management on a publish/subscribe broker.
///
/// The trait requires `Send + Sync`: one broker instance is shared process-wide by
/// every connection that opens or closes a live subscription.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Start receiving messages whose topic matches `filter`.
    ///
    /// Subscribing twice to the same filter is allowed and has no extra effect.
    async fn subscribe(&self, filter: &TopicFilter) -> Result<(), BrokerError>;

    /// Stop receiving messages for `filter`.
    ///
    /// Unsubscribing from a filter that is not active succeeds.
    async fn unsubscribe(&self, filter: &TopicFilter) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn subscribe(&self, filter: &TopicFilter) -> Result<(), BrokerError> {
        (**self).subscribe(filter).await
    }

    async fn unsubscribe(&self, filter: &TopicFilter) -> Result<(), BrokerError> {
        (**self).unsubscribe(filter).await
    }
}

/// Per-message callback invoked by a broker backend.
///
/// Calls may arrive concurrently with each other; implementations must be
/// non-blocking.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, topic: &str);
}

impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    fn on_message(&self, topic: &str) {
        (**self).on_message(topic)
    }
}
