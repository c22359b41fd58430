use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use geobus_core::{ClientCoordinates, SubscriptionId, TopicFilter, VehicleEvent, encode_with_precision};
use geobus_events::{ChannelReceiver, bounded};

use super::SubscriptionError;
use super::registry::{Control, RegistryCounters, RegistryStats};

/// Lifecycle of a [`Subscription`]. There is no way back from `Closed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Active,
    Closed,
}

/// Opens live subscriptions against the process-wide registry.
///
/// Cheap to clone; every clone talks to the same registry task.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    control: mpsc::UnboundedSender<Control>,
    delivery_capacity: usize,
    counters: Arc<RegistryCounters>,
}

impl SubscriptionManager {
    pub(crate) fn new(
        control: mpsc::UnboundedSender<Control>,
        delivery_capacity: usize,
        counters: Arc<RegistryCounters>,
    ) -> Self {
        Self {
            control,
            delivery_capacity,
            counters,
        }
    }

    /// Open a subscription for everything published inside the client's area.
    ///
    /// Returns once the broker-side filter is in place. On error nothing is left
    /// registered.
    pub async fn open(&self, coords: &ClientCoordinates) -> Result<Subscription, SubscriptionError> {
        coords.validate()?;

        let filter = encode_with_precision(&coords.geo_hash(), coords.precision);
        let (sender, receiver) = bounded(self.delivery_capacity);
        let mut subscription = Subscription {
            id: SubscriptionId::new(),
            filter,
            receiver,
            control: self.control.clone(),
            state: SubscriptionState::Created,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.control
            .send(Control::Register {
                id: subscription.id,
                filter: subscription.filter.clone(),
                sender,
                reply: reply_tx,
            })
            .map_err(|_| SubscriptionError::RegistryClosed)?;

        reply_rx
            .await
            .map_err(|_| SubscriptionError::RegistryClosed)??;

        subscription.state = SubscriptionState::Active;
        info!(
            subscription_id = %subscription.id,
            filter = %subscription.filter,
            "live subscription opened"
        );
        Ok(subscription)
    }

    pub fn stats(&self) -> RegistryStats {
        self.counters.snapshot()
    }
}

/// One client's live subscription.
///
/// Owned by exactly one connection handler. Dropping an active subscription
/// releases it as well, so every exit path (including a panic) unregisters it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    filter: TopicFilter,
    receiver: ChannelReceiver<Arc<VehicleEvent>>,
    control: mpsc::UnboundedSender<Control>,
    state: SubscriptionState,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Events missed because this subscriber did not keep up.
    pub fn dropped(&self) -> u64 {
        self.receiver.dropped()
    }

    /// Next matching event; `None` once the subscription is closed or the registry
    /// has gone away.
    pub async fn recv(&mut self) -> Option<Arc<VehicleEvent>> {
        if self.state != SubscriptionState::Active {
            return None;
        }
        self.receiver.recv().await
    }

    /// Unregister the broker-side filter and release the delivery channel.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.state == SubscriptionState::Closed {
            return;
        }
        let was_active = self.state == SubscriptionState::Active;
        self.state = SubscriptionState::Closed;
        self.receiver.close();

        if !was_active {
            return;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.control.send(Control::Unregister {
            id: self.id,
            reply: Some(reply_tx),
        });
        if sent.is_ok() {
            let _ = reply_rx.await;
        }
        info!(subscription_id = %self.id, "live subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.state != SubscriptionState::Active {
            return;
        }
        self.state = SubscriptionState::Closed;
        debug!(subscription_id = %self.id, "releasing dropped subscription");
        let _ = self.control.send(Control::Unregister {
            id: self.id,
            reply: None,
        });
    }
}
