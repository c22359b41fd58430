//! Subscription registry task.
//!
//! One task owns every piece of live-subscriber state; everything else talks to it
//! through messages:
//!
//! - **Control** (unbounded): register / unregister / shutdown. Unbounded so that
//!   `Drop` of a subscription can always enqueue its release.
//! - **Fan-out** (bounded, drop-newest): decoded events from the ingest router.
//! - **Outcomes** (unbounded): results of broker calls running on their own tasks.
//!
//! Broker filters are reference counted. The first subscriber of a filter subscribes
//! it on the broker, the last one to leave unsubscribes it. Broker calls never run
//! on the registry loop: each one is spawned with a deadline and reports back as an
//! [`Outcome`], so a slow broker holds up only the openers waiting on that filter.
//! With firehose ingestion the broker already delivers everything, so filters are
//! only matched locally.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use geobus_core::{SubscriptionId, TopicFilter, VehicleEvent};
use geobus_events::{Broker, BrokerError, ChannelReceiver, ChannelSender, Offer};

use super::SubscriptionError;

/// A decoded event together with the topic it arrived on.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub topic: String,
    pub event: Arc<VehicleEvent>,
}

pub(crate) enum Control {
    Register {
        id: SubscriptionId,
        filter: TopicFilter,
        sender: ChannelSender<Arc<VehicleEvent>>,
        reply: oneshot::Sender<Result<(), SubscriptionError>>,
    },
    Unregister {
        id: SubscriptionId,
        reply: Option<oneshot::Sender<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Default)]
pub(crate) struct RegistryCounters {
    active: AtomicUsize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Live subscriptions currently registered.
    pub active: usize,
    /// Events handed to subscriber channels.
    pub delivered: u64,
    /// Events a lagging subscriber missed because its channel was full.
    pub dropped: u64,
}

impl RegistryCounters {
    pub(crate) fn snapshot(&self) -> RegistryStats {
        RegistryStats {
            active: self.active.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilterMode {
    /// Each distinct live filter is subscribed on the broker.
    BrokerManaged,
    /// The broker delivers every topic; filters are matched here only.
    LocalOnly,
}

struct Subscriber {
    filter: TopicFilter,
    sender: ChannelSender<Arc<VehicleEvent>>,
}

/// An opener parked until its filter's broker call settles.
struct Waiter {
    id: SubscriptionId,
    sender: ChannelSender<Arc<VehicleEvent>>,
    reply: oneshot::Sender<Result<(), SubscriptionError>>,
}

enum FilterState {
    /// Broker subscribe in flight.
    Subscribing(Vec<Waiter>),
    /// Subscribed, with this many registered subscribers.
    Active(usize),
    /// Broker unsubscribe in flight; waiters resubscribe once it settles.
    Unsubscribing(Vec<Waiter>),
}

impl FilterState {
    fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

#[derive(Debug, Clone, Copy)]
enum Call {
    Subscribe,
    Unsubscribe,
}

/// Result of a spawned broker call.
#[derive(Debug)]
pub(crate) enum Outcome {
    Subscribed {
        filter: TopicFilter,
        result: Result<(), BrokerError>,
    },
    Unsubscribed {
        filter: TopicFilter,
        result: Result<(), BrokerError>,
    },
}

pub(crate) struct Registry {
    broker: Arc<dyn Broker>,
    mode: FilterMode,
    max_subscriptions: Option<usize>,
    call_timeout: Duration,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    filters: HashMap<TopicFilter, FilterState>,
    /// Openers parked in `Subscribing` / `Unsubscribing` states.
    waiting: usize,
    /// Spawned broker calls whose outcome has not been applied yet.
    in_flight: usize,
    closing: bool,
    outcome_tx: mpsc::UnboundedSender<Outcome>,
    outcome_rx: mpsc::UnboundedReceiver<Outcome>,
    counters: Arc<RegistryCounters>,
}

impl Registry {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        mode: FilterMode,
        max_subscriptions: Option<usize>,
        call_timeout: Duration,
        counters: Arc<RegistryCounters>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            broker,
            mode,
            max_subscriptions,
            call_timeout,
            subscribers: HashMap::new(),
            filters: HashMap::new(),
            waiting: 0,
            in_flight: 0,
            closing: false,
            outcome_tx,
            outcome_rx,
            counters,
        }
    }

    /// Run until a shutdown request arrives or every control sender is gone.
    pub(crate) async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut fanout: ChannelReceiver<Delivery>,
    ) {
        info!(mode = ?self.mode, "subscription registry started");

        loop {
            tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(Control::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(outcome) = self.outcome_rx.recv() => self.apply(outcome),
                Some(delivery) = fanout.recv() => self.deliver(&delivery),
            }
        }

        info!("subscription registry stopped");
    }

    fn handle(&mut self, command: Control) {
        match command {
            Control::Register {
                id,
                filter,
                sender,
                reply,
            } => self.register(filter, Waiter { id, sender, reply }),
            Control::Unregister { id, reply } => {
                self.release(id);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Control::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn register(&mut self, filter: TopicFilter, waiter: Waiter) {
        if self.closing {
            let _ = waiter.reply.send(Err(SubscriptionError::RegistryClosed));
            return;
        }
        if let Some(limit) = self.max_subscriptions {
            if self.subscribers.len() + self.waiting >= limit {
                let _ = waiter.reply.send(Err(SubscriptionError::LimitReached { limit }));
                return;
            }
        }

        match self.filters.get(&filter).map(FilterState::is_active) {
            Some(true) => {
                if self.admit(filter.clone(), waiter) {
                    if let Some(FilterState::Active(refs)) = self.filters.get_mut(&filter) {
                        *refs += 1;
                    }
                }
            }
            Some(false) => {
                if let Some(FilterState::Subscribing(queue) | FilterState::Unsubscribing(queue)) =
                    self.filters.get_mut(&filter)
                {
                    queue.push(waiter);
                    self.waiting += 1;
                }
            }
            None if self.mode == FilterMode::LocalOnly => {
                if self.admit(filter.clone(), waiter) {
                    self.filters.insert(filter, FilterState::Active(1));
                }
            }
            None => {
                self.filters
                    .insert(filter.clone(), FilterState::Subscribing(vec![waiter]));
                self.waiting += 1;
                self.spawn_call(Call::Subscribe, filter);
            }
        }
    }

    /// Confirm a registration to its opener. `false` if the opener already gave up,
    /// in which case nothing is registered.
    fn admit(&mut self, filter: TopicFilter, waiter: Waiter) -> bool {
        if waiter.reply.send(Ok(())).is_err() {
            debug!(subscription_id = %waiter.id, "opener went away before registration");
            return false;
        }
        self.subscribers.insert(
            waiter.id,
            Subscriber {
                filter,
                sender: waiter.sender,
            },
        );
        self.counters
            .active
            .store(self.subscribers.len(), Ordering::Relaxed);
        true
    }

    fn spawn_call(&mut self, call: Call, filter: TopicFilter) {
        self.in_flight += 1;
        let broker = Arc::clone(&self.broker);
        let outcomes = self.outcome_tx.clone();
        let limit = self.call_timeout;

        tokio::spawn(async move {
            let outcome = match call {
                Call::Subscribe => {
                    let result = within(limit, broker.subscribe(&filter)).await;
                    Outcome::Subscribed { filter, result }
                }
                Call::Unsubscribe => {
                    let result = within(limit, broker.unsubscribe(&filter)).await;
                    Outcome::Unsubscribed { filter, result }
                }
            };
            let _ = outcomes.send(outcome);
        });
    }

    fn apply(&mut self, outcome: Outcome) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match outcome {
            Outcome::Subscribed { filter, result } => {
                let waiters = match self.filters.remove(&filter) {
                    Some(FilterState::Subscribing(waiters)) => waiters,
                    Some(other) => {
                        self.filters.insert(filter, other);
                        return;
                    }
                    None => return,
                };
                self.waiting = self.waiting.saturating_sub(waiters.len());

                if let Err(err) = result {
                    warn!(filter = %filter, error = %err, "broker subscribe failed");
                    reject(waiters, SubscriptionError::Broker(err));
                    return;
                }
                debug!(filter = %filter, "broker filter subscribed");

                let mut refs = 0;
                for waiter in waiters {
                    if self.closing {
                        let _ = waiter.reply.send(Err(SubscriptionError::RegistryClosed));
                    } else if self.admit(filter.clone(), waiter) {
                        refs += 1;
                    }
                }
                if refs > 0 {
                    self.filters.insert(filter, FilterState::Active(refs));
                } else {
                    self.begin_unsubscribe(filter);
                }
            }
            Outcome::Unsubscribed { filter, result } => {
                match &result {
                    Ok(()) => debug!(filter = %filter, "broker filter unsubscribed"),
                    Err(err) => warn!(filter = %filter, error = %err, "broker unsubscribe failed"),
                }
                let waiters = match self.filters.remove(&filter) {
                    Some(FilterState::Unsubscribing(waiters)) => waiters,
                    Some(other) => {
                        self.filters.insert(filter, other);
                        return;
                    }
                    None => return,
                };
                if waiters.is_empty() {
                    return;
                }
                if self.closing {
                    self.waiting = self.waiting.saturating_sub(waiters.len());
                    reject(waiters, SubscriptionError::RegistryClosed);
                    return;
                }
                self.filters
                    .insert(filter.clone(), FilterState::Subscribing(waiters));
                self.spawn_call(Call::Subscribe, filter);
            }
        }
    }

    fn begin_unsubscribe(&mut self, filter: TopicFilter) {
        self.filters
            .insert(filter.clone(), FilterState::Unsubscribing(Vec::new()));
        self.spawn_call(Call::Unsubscribe, filter);
    }

    /// Drop a subscriber; unknown ids are ignored.
    fn release(&mut self, id: SubscriptionId) {
        let Some(subscriber) = self.subscribers.remove(&id) else {
            return;
        };
        self.counters
            .active
            .store(self.subscribers.len(), Ordering::Relaxed);

        let filter = subscriber.filter;
        let remaining = match self.filters.get_mut(&filter) {
            Some(FilterState::Active(refs)) => {
                *refs = refs.saturating_sub(1);
                *refs
            }
            _ => return,
        };
        if remaining > 0 {
            return;
        }

        self.filters.remove(&filter);
        if self.mode == FilterMode::BrokerManaged {
            self.begin_unsubscribe(filter);
        }
    }

    /// Refuse parked openers, release every subscriber, then wait for the broker
    /// calls still in flight. Each call is bounded by the call timeout.
    async fn shutdown(&mut self) {
        self.closing = true;

        let mut parked = Vec::new();
        for state in self.filters.values_mut() {
            if let FilterState::Subscribing(queue) | FilterState::Unsubscribing(queue) = state {
                parked.append(queue);
            }
        }
        self.waiting = 0;
        reject(parked, SubscriptionError::RegistryClosed);

        let ids: Vec<SubscriptionId> = self.subscribers.keys().copied().collect();
        for id in ids {
            self.release(id);
        }

        while self.in_flight > 0 {
            match self.outcome_rx.recv().await {
                Some(outcome) => self.apply(outcome),
                None => break,
            }
        }
    }

    fn deliver(&mut self, delivery: &Delivery) {
        let mut gone = Vec::new();

        for (id, subscriber) in &self.subscribers {
            if !subscriber.filter.matches(&delivery.topic) {
                continue;
            }
            match subscriber.sender.offer(delivery.event.clone()) {
                Offer::Accepted => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Offer::Dropped => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscription_id = %id, "subscriber lagging; event dropped");
                }
                Offer::Closed => gone.push(*id),
            }
        }

        for id in gone {
            self.release(id);
        }
    }
}

fn reject(waiters: Vec<Waiter>, error: SubscriptionError) {
    for waiter in waiters {
        let _ = waiter.reply.send(Err(error.clone()));
    }
}

async fn within<F>(limit: Duration, call: F) -> Result<(), BrokerError>
where
    F: std::future::Future<Output = Result<(), BrokerError>>,
{
    tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
        Err(BrokerError::Unavailable(format!(
            "no broker response within {limit:?}"
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use geobus_core::{ClientCoordinates, encode};
    use geobus_events::{InMemoryBroker, MessageHandler, bounded};
    use tokio::task::JoinHandle;

    use crate::subscriptions::SubscriptionManager;

    struct Discard;

    impl MessageHandler for Discard {
        fn on_message(&self, _topic: &str) {}
    }

    /// Never answers a subscribe for one filter; everything else goes through.
    struct StuckBroker {
        inner: Arc<InMemoryBroker>,
        stuck: TopicFilter,
    }

    #[async_trait]
    impl Broker for StuckBroker {
        async fn subscribe(&self, filter: &TopicFilter) -> Result<(), BrokerError> {
            if *filter == self.stuck {
                std::future::pending::<()>().await;
            }
            self.inner.subscribe(filter).await
        }

        async fn unsubscribe(&self, filter: &TopicFilter) -> Result<(), BrokerError> {
            self.inner.unsubscribe(filter).await
        }
    }

    const SAMPLE: &str =
        "/gtfsrt/vp/fi/HSL/HSL/bus/1001/0/Center/T1/StopA/08:00:00/Bus42/60;24/1/2/3/1/red";

    const HELSINKI: ClientCoordinates = ClientCoordinates {
        latitude: 60.1699,
        longitude: 24.9384,
        precision: 0,
    };

    struct Harness {
        manager: SubscriptionManager,
        control: mpsc::UnboundedSender<Control>,
        fanout: ChannelSender<Delivery>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(broker: Arc<dyn Broker>, mode: FilterMode, limit: Option<usize>) -> Self {
            Self::with_timeout(broker, mode, limit, Duration::from_secs(5), 4)
        }

        fn with_timeout(
            broker: Arc<dyn Broker>,
            mode: FilterMode,
            limit: Option<usize>,
            call_timeout: Duration,
            delivery_capacity: usize,
        ) -> Self {
            let counters = Arc::new(RegistryCounters::default());
            let (control, control_rx) = mpsc::unbounded_channel();
            let (fanout, fanout_rx) = bounded(16);
            let registry = Registry::new(broker, mode, limit, call_timeout, counters.clone());
            let task = tokio::spawn(registry.run(control_rx, fanout_rx));

            Self {
                manager: SubscriptionManager::new(control.clone(), delivery_capacity, counters),
                control,
                fanout,
                task,
            }
        }

        fn stats(&self) -> RegistryStats {
            self.manager.stats()
        }

        async fn stop(self) {
            let (reply, done) = oneshot::channel();
            let _ = self.control.send(Control::Shutdown { reply });
            let _ = done.await;
            let _ = self.task.await;
        }
    }

    fn memory_broker() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::new(Arc::new(Discard)))
    }

    fn delivery() -> Delivery {
        Delivery {
            topic: SAMPLE.to_string(),
            event: Arc::new(geobus_core::decode(SAMPLE).unwrap()),
        }
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn shared_filter_is_subscribed_once_and_released_last() {
        let broker = memory_broker();
        let h = Harness::start(broker.clone(), FilterMode::BrokerManaged, None);
        let filter = encode(60.1699, 24.9384);

        let mut a = h.manager.open(&HELSINKI).await.unwrap();
        let mut b = h.manager.open(&HELSINKI).await.unwrap();
        assert_eq!(broker.subscribe_calls(), 1);

        a.close().await;
        assert!(broker.is_subscribed(&filter));
        assert_eq!(broker.unsubscribe_calls(), 0);

        b.close().await;
        eventually("broker unsubscribe", || !broker.is_subscribed(&filter)).await;
        assert_eq!(broker.unsubscribe_calls(), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn broker_failure_fails_registration() {
        let broker = memory_broker();
        broker.set_available(false);
        let h = Harness::start(broker.clone(), FilterMode::BrokerManaged, None);

        let err = h.manager.open(&HELSINKI).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::Broker(BrokerError::Unavailable(_))));
        assert_eq!(h.stats().active, 0);

        broker.set_available(true);
        let _retry = h.manager.open(&HELSINKI).await.unwrap();
        assert_eq!(h.stats().active, 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn local_mode_never_calls_the_broker() {
        let broker = memory_broker();
        let h = Harness::start(broker.clone(), FilterMode::LocalOnly, None);

        let mut sub = h.manager.open(&HELSINKI).await.unwrap();
        sub.close().await;

        assert_eq!(broker.subscribe_calls(), 0);
        assert_eq!(broker.unsubscribe_calls(), 0);
        h.stop().await;
    }

    #[tokio::test]
    async fn enforces_subscription_cap() {
        let h = Harness::start(memory_broker(), FilterMode::BrokerManaged, Some(1));

        let _first = h.manager.open(&HELSINKI).await.unwrap();
        let err = h
            .manager
            .open(&ClientCoordinates::new(61.0, 24.0))
            .await
            .unwrap_err();
        assert_eq!(err, SubscriptionError::LimitReached { limit: 1 });
        h.stop().await;
    }

    #[tokio::test]
    async fn delivers_only_to_matching_subscribers() {
        let h = Harness::start(memory_broker(), FilterMode::BrokerManaged, None);
        let mut near = h.manager.open(&HELSINKI).await.unwrap();
        let mut far = h.manager.open(&ClientCoordinates::new(-33.8, 151.2)).await.unwrap();

        h.fanout.offer(delivery());

        let got = tokio::time::timeout(Duration::from_secs(2), near.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.vehicle_id, "Bus42");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), far.recv())
                .await
                .is_err()
        );
        eventually("delivery counted", || h.stats().delivered == 1).await;
        h.stop().await;
    }

    #[tokio::test]
    async fn lagging_subscriber_loses_events_and_closed_one_is_removed() {
        let broker = memory_broker();
        let h = Harness::with_timeout(
            broker.clone(),
            FilterMode::BrokerManaged,
            None,
            Duration::from_secs(5),
            1,
        );
        let filter = encode(60.1699, 24.9384);
        let _slow = h.manager.open(&HELSINKI).await.unwrap();

        // A subscriber whose receiving side is already gone.
        let (gone_tx, gone_rx) = bounded(1);
        drop(gone_rx);
        let (reply, registered) = oneshot::channel();
        h.control
            .send(Control::Register {
                id: SubscriptionId::new(),
                filter: filter.clone(),
                sender: gone_tx,
                reply,
            })
            .unwrap();
        registered.await.unwrap().unwrap();
        assert_eq!(h.stats().active, 2);

        h.fanout.offer(delivery());
        h.fanout.offer(delivery());

        eventually("both deliveries handled", || {
            let stats = h.stats();
            stats.delivered == 1 && stats.dropped == 1
        })
        .await;
        assert_eq!(h.stats().active, 1);
        assert!(broker.is_subscribed(&filter));
        h.stop().await;
    }

    #[tokio::test]
    async fn opening_while_the_filter_unsubscribes_resubscribes_it() {
        let broker = memory_broker();
        let h = Harness::start(broker.clone(), FilterMode::BrokerManaged, None);
        let filter = encode(60.1699, 24.9384);

        let mut first = h.manager.open(&HELSINKI).await.unwrap();
        first.close().await;
        let _second = h.manager.open(&HELSINKI).await.unwrap();

        assert!(broker.is_subscribed(&filter));
        assert_eq!(broker.subscribe_calls(), 2);
        assert_eq!(h.stats().active, 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn unresponsive_broker_stalls_only_its_own_filter() {
        let inner = memory_broker();
        let broker = Arc::new(StuckBroker {
            inner: inner.clone(),
            stuck: encode(10.0, 10.0),
        });
        let h = Harness::with_timeout(
            broker,
            FilterMode::BrokerManaged,
            None,
            Duration::from_millis(300),
            4,
        );

        let mut a = h.manager.open(&HELSINKI).await.unwrap();

        let manager = h.manager.clone();
        let pending = tokio::spawn(async move {
            manager.open(&ClientCoordinates::new(10.0, 10.0)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        h.fanout.offer(delivery());
        let got = tokio::time::timeout(Duration::from_secs(1), a.recv())
            .await
            .expect("delivery held up by a pending broker call")
            .unwrap();
        assert_eq!(got.vehicle_id, "Bus42");

        tokio::time::timeout(Duration::from_secs(1), a.close())
            .await
            .expect("close held up by a pending broker call");

        let err = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::Broker(BrokerError::Unavailable(_))));
        assert_eq!(h.stats().active, 0);

        let filter = encode(60.1699, 24.9384);
        eventually("broker unsubscribe", || !inner.is_subscribed(&filter)).await;
        h.stop().await;
    }

    #[tokio::test]
    async fn shutdown_refuses_parked_openers() {
        let inner = memory_broker();
        let broker = Arc::new(StuckBroker {
            inner,
            stuck: encode(10.0, 10.0),
        });
        let h = Harness::with_timeout(
            broker,
            FilterMode::BrokerManaged,
            None,
            Duration::from_millis(200),
            4,
        );

        let manager = h.manager.clone();
        let pending = tokio::spawn(async move {
            manager.open(&ClientCoordinates::new(10.0, 10.0)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), h.stop())
            .await
            .expect("shutdown did not finish");
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err, SubscriptionError::RegistryClosed);
    }
}
