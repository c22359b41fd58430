use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use geobus_core::VehicleEvent;

use super::point::{RangeQuery, TelemetryPoint};
use super::r#trait::{StoreError, TelemetryStore};

/// In-memory telemetry store.
///
/// Intended for tests/dev. Not optimized for performance; history is never pruned.
#[derive(Debug, Default)]
pub struct InMemoryTelemetryStore {
    points: RwLock<Vec<TelemetryPoint>>,
    failing: AtomicBool,
}

impl InMemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as if the store were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of every stored point, in write order.
    pub fn points(&self) -> Vec<TelemetryPoint> {
        self.points.read().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a point as-is (e.g. with a backdated timestamp).
    pub fn insert(&self, point: TelemetryPoint) -> Result<(), StoreError> {
        self.check()?;
        self.points
            .write()
            .map_err(|_| StoreError::Rejected("lock poisoned".to_string()))?
            .push(point);
        Ok(())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unreachable("in-memory store is failing".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn write(&self, point: &TelemetryPoint) -> Result<(), StoreError> {
        self.insert(point.clone())
    }

    async fn query(&self, query: &RangeQuery) -> Result<Vec<VehicleEvent>, StoreError> {
        self.check()?;

        let window = chrono::Duration::from_std(query.window)
            .map_err(|e| StoreError::Rejected(format!("invalid window: {e}")))?;
        let since = Utc::now() - window;

        let points = self
            .points
            .read()
            .map_err(|_| StoreError::Rejected("lock poisoned".to_string()))?;

        let mut matching: Vec<&TelemetryPoint> = points
            .iter()
            .filter(|p| p.timestamp >= since)
            .filter(|p| p.tag(query.tag.key) == Some(query.tag.value.as_str()))
            .collect();
        matching.sort_by_key(|p| p.timestamp);

        Ok(matching.into_iter().map(TelemetryPoint::to_event).collect())
    }
}
