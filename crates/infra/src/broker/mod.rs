//! Broker backends.
//!
//! The in-memory broker lives in `geobus-events`; the MQTT backend is behind the
//! `mqtt` feature.

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttBroker;
