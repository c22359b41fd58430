//! In-memory broker for tests/dev.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::trace;

use geobus_core::TopicFilter;

use crate::broker::{Broker, BrokerError, MessageHandler};

/// Process-local broker.
///
/// - No IO
/// - A published topic is handed to the handler once if any active filter matches
/// - Availability can be toggled to exercise failure paths
pub struct InMemoryBroker {
    handler: Arc<dyn MessageHandler>,
    filters: Mutex<BTreeSet<TopicFilter>>,
    available: AtomicBool,
    subscribe_calls: AtomicU64,
    unsubscribe_calls: AtomicU64,
}

impl InMemoryBroker {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handler,
            filters: Mutex::new(BTreeSet::new()),
            available: AtomicBool::new(true),
            subscribe_calls: AtomicU64::new(0),
            unsubscribe_calls: AtomicU64::new(0),
        }
    }

    /// Publish a message; returns whether any active filter matched it.
    pub fn publish(&self, topic: &str) -> bool {
        let matched = match self.filters.lock() {
            Ok(filters) => filters.iter().any(|f| f.matches(topic)),
            Err(_) => false,
        };

        if matched {
            self.handler.on_message(topic);
        } else {
            trace!(topic, "no active filter matches; message discarded");
        }
        matched
    }

    /// Currently active filters, in lexical order.
    pub fn subscriptions(&self) -> Vec<TopicFilter> {
        self.filters
            .lock()
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, filter: &TopicFilter) -> bool {
        self.filters
            .lock()
            .map(|f| f.contains(filter))
            .unwrap_or(false)
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> u64 {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker is offline".to_string()))
        }
    }
}

impl core::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("filters", &self.subscriptions())
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn subscribe(&self, filter: &TopicFilter) -> Result<(), BrokerError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut filters = self
            .filters
            .lock()
            .map_err(|_| BrokerError::Unavailable("lock poisoned".to_string()))?;
        filters.insert(filter.clone());
        Ok(())
    }

    async fn unsubscribe(&self, filter: &TopicFilter) -> Result<(), BrokerError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut filters = self
            .filters
            .lock()
            .map_err(|_| BrokerError::Unavailable("lock poisoned".to_string()))?;
        filters.remove(filter);
        Ok(())
    }
}
