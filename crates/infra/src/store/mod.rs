//! Time-series store boundary.
//!
//! Defines the narrow surface the pipeline needs from the store (write one point,
//! range-query by tag) without assuming a particular database.

#[cfg(feature = "influxdb")]
pub mod influx;
pub mod in_memory;
pub mod point;
pub mod r#trait;

#[cfg(feature = "influxdb")]
pub use influx::InfluxTelemetryStore;
pub use in_memory::InMemoryTelemetryStore;
pub use point::{MEASUREMENT, RangeQuery, TagFilter, TagKey, TelemetryPoint};
pub use r#trait::{StoreError, TelemetryStore};
