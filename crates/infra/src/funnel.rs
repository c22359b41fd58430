//! Persistence funnel: the single writer between the event channel and the store.
//!
//! Exactly one funnel runs per process. It drains the event channel in order and
//! awaits each store write before taking the next event, so persisted order equals
//! channel order. A failed write is logged and the event dropped; nothing is retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use geobus_core::VehicleEvent;
use geobus_events::ChannelReceiver;

use crate::store::{TelemetryPoint, TelemetryStore};

#[derive(Debug, Default)]
pub(crate) struct FunnelCounters {
    written: AtomicU64,
    failed: AtomicU64,
}

impl FunnelCounters {
    pub(crate) fn snapshot(&self) -> FunnelStats {
        FunnelStats {
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct FunnelStats {
    pub written: u64,
    pub failed: u64,
}

/// Handle to observe and stop a running funnel.
#[derive(Debug)]
pub struct FunnelHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    counters: Arc<FunnelCounters>,
}

impl FunnelHandle {
    pub fn stats(&self) -> FunnelStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> Arc<FunnelCounters> {
        self.counters.clone()
    }

    /// Stop accepting events, write what is already queued, then stop.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "persistence funnel task failed");
            }
        }
    }
}

#[derive(Debug)]
pub struct PersistenceFunnel;

impl PersistenceFunnel {
    /// Spawn the funnel task on the current tokio runtime.
    pub fn spawn<S>(store: S, receiver: ChannelReceiver<Arc<VehicleEvent>>) -> FunnelHandle
    where
        S: TelemetryStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let counters = Arc::new(FunnelCounters::default());
        let join = tokio::spawn(run(store, receiver, shutdown_rx, counters.clone()));

        FunnelHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            counters,
        }
    }
}

async fn run<S>(
    store: S,
    mut receiver: ChannelReceiver<Arc<VehicleEvent>>,
    mut shutdown: oneshot::Receiver<()>,
    counters: Arc<FunnelCounters>,
) where
    S: TelemetryStore,
{
    info!("persistence funnel started");

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                receiver.close();
                while let Some(event) = receiver.recv().await {
                    persist(&store, &event, &counters).await;
                }
                break;
            }
            next = receiver.recv() => match next {
                Some(event) => persist(&store, &event, &counters).await,
                None => break,
            },
        }
    }

    info!(
        written = counters.written.load(Ordering::Relaxed),
        failed = counters.failed.load(Ordering::Relaxed),
        dropped = receiver.dropped(),
        "persistence funnel stopped"
    );
}

async fn persist<S>(store: &S, event: &VehicleEvent, counters: &FunnelCounters)
where
    S: TelemetryStore,
{
    let point = TelemetryPoint::from_event(event, Utc::now());
    match store.write(&point).await {
        Ok(()) => {
            counters.written.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                vehicle_id = %event.vehicle_id,
                error = %err,
                "telemetry write failed; event dropped"
            );
        }
    }
}
