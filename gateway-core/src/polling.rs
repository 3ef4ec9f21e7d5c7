//! Polling Engine: one logical timer per connection, serialized
//! ticks, cooperative cancellation. Mirrors the adapter layer's
//! `tokio::spawn` + atomic-guard pattern (see `adapter::modbus::Inner::spawn_reconnect`)
//! rather than a shared scheduler, so one connection's slow tick can never
//! delay another's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::model::{DataPoint, Quality};

const DEFAULT_INTERVAL_MS: u64 = 1000;
const MIN_INTERVAL_MS: u64 = 100;

/// What PE needs from the rest of the system each tick: the connection's
/// adapter (through CM) and a sink for the resulting points. Kept as a
/// trait so `polling.rs` doesn't depend on `manager.rs` directly.
#[async_trait::async_trait]
pub trait PollTarget: Send + Sync {
    async fn poll_once(&self, connection_id: Uuid) -> Vec<DataPoint>;
    async fn publish(&self, connection_id: Uuid, points: Vec<DataPoint>);
}

struct Handle {
    interval_ms: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct PollingEngine {
    handles: Mutex<HashMap<Uuid, Handle>>,
}

impl PollingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) the timer for `connection_id`. A connection
    /// already running is stopped first so there is never more than one
    /// live timer per connection.
    pub async fn start(&self, connection_id: Uuid, interval_ms: u64, target: Arc<dyn PollTarget>) {
        self.stop(connection_id).await;
        let interval_ms = interval_ms.max(MIN_INTERVAL_MS);
        let interval = Arc::new(AtomicU64::new(interval_ms));
        let interval_for_task = Arc::clone(&interval);
        let task = tokio::spawn(async move {
            loop {
                let wait = interval_for_task.load(Ordering::Relaxed);
                tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
                let points = target.poll_once(connection_id).await;
                if !points.is_empty() {
                    target.publish(connection_id, points).await;
                } else {
                    debug!(connection = %connection_id, "poll tick produced no points");
                }
            }
        });
        self.handles.lock().await.insert(connection_id, Handle { interval_ms: interval, task });
    }

    /// Cooperative cancellation: the in-flight tick (if any) is dropped
    /// along with the task, so any result it was computing is simply
    /// discarded rather than published.
    pub async fn stop(&self, connection_id: Uuid) {
        if let Some(handle) = self.handles.lock().await.remove(&connection_id) {
            handle.task.abort();
        }
    }

    pub async fn set_interval(&self, connection_id: Uuid, interval_ms: u64) {
        let interval_ms = interval_ms.max(MIN_INTERVAL_MS);
        if let Some(handle) = self.handles.lock().await.get(&connection_id) {
            handle.interval_ms.store(interval_ms, Ordering::Relaxed);
        }
    }

    pub async fn is_running(&self, connection_id: Uuid) -> bool {
        self.handles.lock().await.contains_key(&connection_id)
    }

    pub async fn stop_all(&self) {
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain() {
            handle.task.abort();
        }
    }
}

pub fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

/// Turns one `ReadResult` into a `DataPoint`, applying the adapter's
/// timestamp when it provided one (it always does; this exists for the
/// degenerate all-zero fallback CM may construct for a disconnected poll).
pub fn datapoint_from_read(tag_id: Uuid, value: crate::model::Value, quality: Quality, timestamp: i64) -> DataPoint {
    DataPoint::new(tag_id, timestamp, value, quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTarget {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PollTarget for CountingTarget {
        async fn poll_once(&self, _connection_id: Uuid) -> Vec<DataPoint> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
        async fn publish(&self, _connection_id: Uuid, _points: Vec<DataPoint>) {}
    }

    #[tokio::test]
    async fn start_then_stop_cancels_the_timer() {
        let engine = PollingEngine::new();
        let target = Arc::new(CountingTarget { calls: AtomicUsize::new(0) });
        let id = Uuid::new_v4();
        engine.start(id, 100, target.clone()).await;
        assert!(engine.is_running(id).await);
        engine.stop(id).await;
        assert!(!engine.is_running(id).await);
    }

    #[tokio::test]
    async fn interval_below_floor_is_clamped() {
        let engine = PollingEngine::new();
        let target = Arc::new(CountingTarget { calls: AtomicUsize::new(0) });
        let id = Uuid::new_v4();
        engine.start(id, 10, target).await;
        let handles = engine.handles.lock().await;
        assert_eq!(handles.get(&id).unwrap().interval_ms.load(Ordering::Relaxed), MIN_INTERVAL_MS);
    }
}
