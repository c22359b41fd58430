use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

use geobus_core::{VehicleEvent, decode};
use geobus_events::{ChannelSender, MessageHandler, Offer};

use super::registry::Delivery;

#[derive(Debug, Default)]
pub(crate) struct IngestCounters {
    received: AtomicU64,
    malformed: AtomicU64,
    ingest_dropped: AtomicU64,
    fanout_dropped: AtomicU64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Topics decoded successfully.
    pub received: u64,
    /// Topics dropped because they did not decode.
    pub malformed: u64,
    /// Events not persisted because the event channel was full.
    pub ingest_dropped: u64,
    /// Events not offered to live subscribers because the fan-out queue was full.
    pub fanout_dropped: u64,
}

/// Broker callback: decode once, then hand the event to persistence and live fan-out.
///
/// Never blocks and never touches the store.
#[derive(Debug, Clone)]
pub struct IngestRouter {
    ingest: ChannelSender<Arc<VehicleEvent>>,
    fanout: ChannelSender<Delivery>,
    counters: Arc<IngestCounters>,
}

impl IngestRouter {
    pub(crate) fn new(
        ingest: ChannelSender<Arc<VehicleEvent>>,
        fanout: ChannelSender<Delivery>,
    ) -> Self {
        Self {
            ingest,
            fanout,
            counters: Arc::new(IngestCounters::default()),
        }
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            received: self.counters.received.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            ingest_dropped: self.counters.ingest_dropped.load(Ordering::Relaxed),
            fanout_dropped: self.counters.fanout_dropped.load(Ordering::Relaxed),
        }
    }
}

impl MessageHandler for IngestRouter {
    fn on_message(&self, topic: &str) {
        let event = match decode(topic) {
            Ok(event) => Arc::new(event),
            Err(err) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(topic, error = %err, "dropping undecodable topic");
                return;
            }
        };
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        match self.ingest.offer(event.clone()) {
            Offer::Accepted => {}
            Offer::Dropped => {
                self.counters.ingest_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(vehicle_id = %event.vehicle_id, "event channel full; event not persisted");
            }
            Offer::Closed => debug!("event channel closed; event not persisted"),
        }

        let delivery = Delivery {
            topic: topic.to_string(),
            event,
        };
        match self.fanout.offer(delivery) {
            Offer::Accepted => {}
            Offer::Dropped => {
                self.counters.fanout_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("fan-out queue full; live delivery skipped");
            }
            Offer::Closed => debug!("subscription registry stopped; live delivery skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geobus_events::bounded;

    const SAMPLE: &str =
        "/gtfsrt/vp/fi/HSL/HSL/bus/1001/0/Center/T1/StopA/08:00:00/Bus42/60;24/1/2/3/1/red";

    #[tokio::test]
    async fn decodes_once_and_feeds_both_paths() {
        let (ingest_tx, mut ingest_rx) = bounded(4);
        let (fanout_tx, mut fanout_rx) = bounded(4);
        let router = IngestRouter::new(ingest_tx, fanout_tx);

        router.on_message(SAMPLE);

        let persisted = ingest_rx.try_recv().unwrap();
        let delivered = fanout_rx.try_recv().unwrap();
        assert_eq!(persisted.vehicle_id, "Bus42");
        assert!(Arc::ptr_eq(&persisted, &delivered.event));
        assert_eq!(delivered.topic, SAMPLE);
        assert_eq!(router.stats().received, 1);
    }

    #[tokio::test]
    async fn malformed_topic_yields_nothing() {
        let (ingest_tx, mut ingest_rx) = bounded(4);
        let (fanout_tx, mut fanout_rx) = bounded(4);
        let router = IngestRouter::new(ingest_tx, fanout_tx);

        router.on_message("/gtfsrt/vp/fi/HSL/HSL/bus/1001/0/Center/T1/StopA/08:00:00/Bus42/60;24/1/2");

        assert!(ingest_rx.try_recv().is_none());
        assert!(fanout_rx.try_recv().is_none());
        assert_eq!(router.stats().malformed, 1);
        assert_eq!(router.stats().received, 0);
    }

    #[tokio::test]
    async fn full_event_channel_sheds_without_blocking() {
        let (ingest_tx, _ingest_rx) = bounded(1);
        let (fanout_tx, _fanout_rx) = bounded(8);
        let router = IngestRouter::new(ingest_tx, fanout_tx);

        for _ in 0..3 {
            router.on_message(SAMPLE);
        }

        let stats = router.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.ingest_dropped, 2);
        assert_eq!(stats.fanout_dropped, 0);
    }
}
