//! HTTP API: REST queries over stored telemetry and the live WebSocket feed.

pub mod app;
