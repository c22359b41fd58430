//! `geobus-core`: vehicle telemetry domain primitives.
//!
//! This crate contains **pure domain** code (no broker, store or HTTP concerns):
//! the decoded event record, coordinate bucketing and the topic codec.

pub mod error;
pub mod geo;
pub mod id;
pub mod topic;
pub mod vehicle;

pub use error::{DomainError, DomainResult, TopicError};
pub use geo::{ClientCoordinates, GeoCell, GeoHash};
pub use id::SubscriptionId;
pub use topic::{TopicFilter, decode, encode, encode_cell, encode_with_precision};
pub use vehicle::{StopRef, VehicleEvent};
