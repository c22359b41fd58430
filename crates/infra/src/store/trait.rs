use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use geobus_core::VehicleEvent;

use super::point::{RangeQuery, TelemetryPoint};

/// Time-series store operation error.
///
/// ## Error Categories
///
/// - **Unreachable**: the store could not be contacted (connection refused, timeout)
/// - **Rejected**: the store answered with an error status
/// - **InvalidResponse**: the store answered with something that could not be read
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("store rejected request: {0}")]
    Rejected(String),

    #[error("invalid store response: {0}")]
    InvalidResponse(String),
}

/// Narrow read/write surface of the time-series store.
///
/// ## Write Semantics
///
/// `write()` persists one point. Callers serialize writes (see the persistence
/// funnel); implementations need not order concurrent writers.
///
/// ## Query Semantics
///
/// `query()` returns every point of the vehicle measurement written within the
/// lookback window whose tag equals the requested value, oldest first. An empty
/// result is not an error.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Readiness check.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn write(&self, point: &TelemetryPoint) -> Result<(), StoreError>;

    async fn query(&self, query: &RangeQuery) -> Result<Vec<VehicleEvent>, StoreError>;
}

#[async_trait]
impl<S> TelemetryStore for Arc<S>
where
    S: TelemetryStore + ?Sized,
{
    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }

    async fn write(&self, point: &TelemetryPoint) -> Result<(), StoreError> {
        (**self).write(point).await
    }

    async fn query(&self, query: &RangeQuery) -> Result<Vec<VehicleEvent>, StoreError> {
        (**self).query(query).await
    }
}
