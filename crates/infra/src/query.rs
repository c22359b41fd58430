//! On-demand queries against stored history.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use geobus_core::geo::validate_coordinate;
use geobus_core::{DomainError, GeoCell, StopRef, VehicleEvent};

use crate::store::{RangeQuery, StoreError, TagKey, TelemetryStore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error(transparent)]
    InvalidInput(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read side over the telemetry store. Every query covers the same lookback window.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn TelemetryStore>,
    window: Duration,
}

impl core::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueryService")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl QueryService {
    pub fn new(store: Arc<dyn TelemetryStore>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Records in the GeoCell containing `(latitude, longitude)`.
    pub async fn near(&self, latitude: f64, longitude: f64) -> Result<Vec<VehicleEvent>, QueryError> {
        validate_coordinate("latitude", latitude, 90.0)?;
        validate_coordinate("longitude", longitude, 180.0)?;

        let cell = GeoCell::from_coordinates(latitude, longitude);
        let query = RangeQuery::tag_equals(TagKey::GeohashHead, cell.to_string(), self.window);
        Ok(self.store.query(&query).await?)
    }

    /// One query per stop, in list order; the last matching record found wins.
    ///
    /// A stop without records leaves an earlier match in place. `None` when no stop
    /// had any record.
    pub async fn from_stops(&self, stops: &[StopRef]) -> Result<Option<VehicleEvent>, QueryError> {
        if stops.is_empty() {
            return Err(DomainError::validation("at least one stop is required").into());
        }
        if let Some(idx) = stops.iter().position(|s| s.next_stop.trim().is_empty()) {
            return Err(DomainError::validation(format!("stop at index {idx} has an empty id")).into());
        }

        let mut found = None;
        for stop in stops {
            let query = RangeQuery::tag_equals(TagKey::NextStop, stop.next_stop.as_str(), self.window);
            let records = self.store.query(&query).await?;
            debug!(stop = %stop.next_stop, records = records.len(), "stop query");
            if let Some(last) = records.into_iter().last() {
                found = Some(last);
            }
        }
        Ok(found)
    }

    /// Every record of one vehicle, oldest first.
    pub async fn vehicle_history(&self, vehicle_id: &str) -> Result<Vec<VehicleEvent>, QueryError> {
        if vehicle_id.trim().is_empty() {
            return Err(DomainError::validation("vehicle id must not be empty").into());
        }
        let query = RangeQuery::tag_equals(TagKey::VehicleId, vehicle_id, self.window);
        Ok(self.store.query(&query).await?)
    }
}
