//! Infrastructure layer: configuration, store and broker backends, and the
//! ingestion / live-distribution pipeline built on them.

pub mod broker;
pub mod config;
pub mod funnel;
pub mod pipeline;
pub mod query;
pub mod store;
pub mod subscriptions;

pub use config::{AppConfig, ConfigError};
pub use pipeline::{InMemoryPipeline, Pipeline, PipelineError, PipelineMonitor, PipelineStats};
pub use query::{QueryError, QueryService};
pub use subscriptions::{Subscription, SubscriptionError, SubscriptionManager, SubscriptionState};
