//! Live, geographically filtered subscriptions.
//!
//! - [`IngestRouter`]: the broker callback (decode once, fan out, never block)
//! - `registry`: the task owning every subscriber and the broker filters
//! - [`SubscriptionManager`] / [`Subscription`]: what a connection handler uses

use thiserror::Error;

use geobus_core::DomainError;
use geobus_events::BrokerError;

pub mod manager;
pub(crate) mod registry;
pub mod router;

pub use manager::{Subscription, SubscriptionManager, SubscriptionState};
pub use registry::RegistryStats;
pub use router::{IngestRouter, IngestStats};

/// Failure to open a live subscription. Fatal to that one connection only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error(transparent)]
    InvalidCoordinates(#[from] DomainError),

    #[error("broker subscription failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("live subscription limit reached ({limit})")]
    LimitReached { limit: usize },

    #[error("subscription registry is not running")]
    RegistryClosed,
}
