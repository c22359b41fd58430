//! Process wiring: one store, one broker connection, one funnel, one registry.
//!
//! Construction order follows the data flow backwards: channels first, then the
//! ingest router (the broker callback), the broker, the registry and the funnel.
//! Everything is created here once and torn down by [`Pipeline::shutdown`].

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use geobus_core::{TopicFilter, VehicleEvent};
use geobus_events::{Broker, BrokerError, ChannelReceiver, InMemoryBroker, MessageHandler, bounded};

use crate::config::{AppConfig, BrokerBackend, ConfigError, StoreBackend};
use crate::funnel::{FunnelCounters, FunnelHandle, FunnelStats, PersistenceFunnel};
use crate::query::QueryService;
use crate::store::{InMemoryTelemetryStore, StoreError, TelemetryStore};
use crate::subscriptions::registry::{Control, Delivery, FilterMode, Registry, RegistryCounters};
use crate::subscriptions::{IngestRouter, IngestStats, RegistryStats, SubscriptionManager};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("store not ready: {0}")]
    Store(#[from] StoreError),

    #[error("broker not ready: {0}")]
    Broker(#[from] BrokerError),

    #[error("{backend} backend requested but the '{feature}' feature is not enabled")]
    FeatureDisabled {
        backend: &'static str,
        feature: &'static str,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub ingest: IngestStats,
    pub persistence: FunnelStats,
    pub subscriptions: RegistryStats,
}

enum BrokerHandle {
    Memory(Arc<InMemoryBroker>),
    #[cfg(feature = "mqtt")]
    Mqtt(Arc<crate::broker::MqttBroker>),
}

impl BrokerHandle {
    fn as_broker(&self) -> Arc<dyn Broker> {
        match self {
            Self::Memory(b) => Arc::clone(b) as Arc<dyn Broker>,
            #[cfg(feature = "mqtt")]
            Self::Mqtt(b) => Arc::clone(b) as Arc<dyn Broker>,
        }
    }

    async fn disconnect(&self) {
        match self {
            Self::Memory(_) => {}
            #[cfg(feature = "mqtt")]
            Self::Mqtt(b) => b.disconnect().await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineMonitor {
    router: IngestRouter,
    funnel: Arc<FunnelCounters>,
    subscriptions: SubscriptionManager,
}

impl PipelineMonitor {
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            ingest: self.router.stats(),
            persistence: self.funnel.snapshot(),
            subscriptions: self.subscriptions.stats(),
        }
    }
}

/// The running ingestion and distribution pipeline.
pub struct Pipeline {
    broker: BrokerHandle,
    router: IngestRouter,
    subscriptions: SubscriptionManager,
    queries: QueryService,
    control: mpsc::UnboundedSender<Control>,
    registry: JoinHandle<()>,
    funnel: FunnelHandle,
    firehose: Option<TopicFilter>,
}

impl core::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipeline")
            .field("firehose", &self.firehose)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// An in-memory pipeline plus direct handles on its broker and store.
#[derive(Debug)]
pub struct InMemoryPipeline {
    pub pipeline: Pipeline,
    pub broker: Arc<InMemoryBroker>,
    pub store: Arc<InMemoryTelemetryStore>,
}

impl Pipeline {
    /// Build the backends named by `config`, check store readiness and start.
    pub async fn start(config: &AppConfig) -> Result<Self, PipelineError> {
        let store = build_store(config)?;
        store.ping().await?;
        info!(backend = ?config.store_backend, "telemetry store ready");

        let wiring = Wiring::new(config);
        let broker = match config.broker_backend {
            BrokerBackend::Memory => BrokerHandle::Memory(Arc::new(InMemoryBroker::new(wiring.handler()))),
            BrokerBackend::Mqtt => connect_mqtt(&config.mqtt, wiring.handler())?,
        };
        wiring.finish(config, store, broker).await
    }

    /// In-memory store and broker; buffers, window and cap still come from `config`.
    pub async fn in_memory(config: &AppConfig) -> Result<InMemoryPipeline, PipelineError> {
        let store = Arc::new(InMemoryTelemetryStore::new());
        let wiring = Wiring::new(config);
        let broker = Arc::new(InMemoryBroker::new(wiring.handler()));

        let pipeline = wiring
            .finish(config, store.clone(), BrokerHandle::Memory(broker.clone()))
            .await?;
        Ok(InMemoryPipeline {
            pipeline,
            broker,
            store,
        })
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn queries(&self) -> &QueryService {
        &self.queries
    }

    pub fn stats(&self) -> PipelineStats {
        self.monitor().stats()
    }

    /// Detached, cloneable view of the pipeline counters.
    pub fn monitor(&self) -> PipelineMonitor {
        PipelineMonitor {
            router: self.router.clone(),
            funnel: self.funnel.counters(),
            subscriptions: self.subscriptions.clone(),
        }
    }

    /// Release live subscriptions, disconnect from the broker, then drain the funnel.
    pub async fn shutdown(self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.control.send(Control::Shutdown { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
        if let Err(err) = self.registry.await {
            warn!(error = %err, "subscription registry task failed");
        }

        if let Some(all) = &self.firehose {
            if let Err(err) = self.broker.as_broker().unsubscribe(all).await {
                warn!(error = %err, "firehose unsubscribe failed");
            }
        }
        self.broker.disconnect().await;
        self.funnel.shutdown().await;
        info!("pipeline stopped");
    }
}

/// Channels and the ingest router, created before the broker that calls into them.
struct Wiring {
    router: IngestRouter,
    ingest_rx: ChannelReceiver<Arc<VehicleEvent>>,
    fanout_rx: ChannelReceiver<Delivery>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Wiring {
    fn new(config: &AppConfig) -> Self {
        let (ingest_tx, ingest_rx) = bounded(config.ingest_buffer);
        let (fanout_tx, fanout_rx) = bounded(config.ingest_buffer);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Self {
            router: IngestRouter::new(ingest_tx, fanout_tx),
            ingest_rx,
            fanout_rx,
            control_tx,
            control_rx,
        }
    }

    fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(self.router.clone())
    }

    async fn finish(
        self,
        config: &AppConfig,
        store: Arc<dyn TelemetryStore>,
        broker: BrokerHandle,
    ) -> Result<Pipeline, PipelineError> {
        let firehose = if config.ingest_all {
            let all = TopicFilter::all();
            broker.as_broker().subscribe(&all).await?;
            info!(filter = %all, "firehose ingestion enabled");
            Some(all)
        } else {
            None
        };
        let mode = if firehose.is_some() {
            FilterMode::LocalOnly
        } else {
            FilterMode::BrokerManaged
        };

        let counters = Arc::new(RegistryCounters::default());
        let registry = Registry::new(
            broker.as_broker(),
            mode,
            config.max_subscriptions,
            config.broker_timeout,
            counters.clone(),
        );
        let registry = tokio::spawn(registry.run(self.control_rx, self.fanout_rx));

        let funnel = PersistenceFunnel::spawn(store.clone(), self.ingest_rx);

        Ok(Pipeline {
            broker,
            router: self.router,
            subscriptions: SubscriptionManager::new(
                self.control_tx.clone(),
                config.delivery_buffer,
                counters,
            ),
            queries: QueryService::new(store, config.query_window),
            control: self.control_tx,
            registry,
            funnel,
            firehose,
        })
    }
}

fn build_store(config: &AppConfig) -> Result<Arc<dyn TelemetryStore>, PipelineError> {
    match config.store_backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryTelemetryStore::new())),
        #[cfg(feature = "influxdb")]
        StoreBackend::InfluxDb => Ok(Arc::new(crate::store::InfluxTelemetryStore::new(
            config.influx.clone(),
        )?)),
        #[cfg(not(feature = "influxdb"))]
        StoreBackend::InfluxDb => Err(PipelineError::FeatureDisabled {
            backend: "influxdb",
            feature: "influxdb",
        }),
    }
}

#[cfg(feature = "mqtt")]
fn connect_mqtt(
    config: &crate::config::MqttConfig,
    handler: Arc<dyn MessageHandler>,
) -> Result<BrokerHandle, PipelineError> {
    let broker = crate::broker::MqttBroker::connect(config, handler)?;
    Ok(BrokerHandle::Mqtt(Arc::new(broker)))
}

#[cfg(not(feature = "mqtt"))]
fn connect_mqtt(
    _config: &crate::config::MqttConfig,
    _handler: Arc<dyn MessageHandler>,
) -> Result<BrokerHandle, PipelineError> {
    Err(PipelineError::FeatureDisabled {
        backend: "mqtt",
        feature: "mqtt",
    })
}
