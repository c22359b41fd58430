//! Services shared by every handler.

use std::time::Duration;

use geobus_infra::{AppConfig, Pipeline, PipelineMonitor, QueryService, SubscriptionManager};

/// Everything a handler needs, cloned out of the running pipeline.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub queries: QueryService,
    pub subscriptions: SubscriptionManager,
    pub monitor: PipelineMonitor,
    /// Time a live client gets to send its coordinates.
    pub handshake_timeout: Duration,
}

impl AppServices {
    pub fn new(pipeline: &Pipeline, config: &AppConfig) -> Self {
        Self {
            queries: pipeline.queries().clone(),
            subscriptions: pipeline.subscriptions().clone(),
            monitor: pipeline.monitor(),
            handshake_timeout: config.handshake_timeout,
        }
    }
}
