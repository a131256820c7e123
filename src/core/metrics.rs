//! Observable health and usage metrics for the upstream service

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Upstream health as seen by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    #[default]
    Idle,
    Healthy,
    Degraded,
    Down,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Idle => write!(f, "IDLE"),
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Down => write!(f, "DOWN"),
        }
    }
}

/// Point-in-time copy of all metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limit_count: u64,
    pub last_latency_ms: u64,
    pub avg_latency_ms: u64,
    pub last_error: Option<String>,
    pub status: HealthStatus,
    pub last_check_timestamp: i64,
    pub total_tokens_used: u64,
    pub reservoir_tokens: u64,
    pub is_circuit_open: bool,
}

impl MetricsSnapshot {
    /// Zero-state snapshot
    pub fn fresh(now_ms: i64, reservoir_tokens: u64) -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rate_limit_count: 0,
            last_latency_ms: 0,
            avg_latency_ms: 0,
            last_error: None,
            status: HealthStatus::Idle,
            last_check_timestamp: now_ms,
            total_tokens_used: 0,
            reservoir_tokens,
            is_circuit_open: false,
        }
    }

    /// Fold a latency sample into the moving average
    pub fn record_latency(&mut self, latency_ms: u64) {
        self.last_latency_ms = latency_ms;
        self.avg_latency_ms = if self.avg_latency_ms == 0 {
            latency_ms
        } else {
            (self.avg_latency_ms as f64 * 0.9 + latency_ms as f64 * 0.1).round() as u64
        };
    }
}

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<u64, Listener>>,
}

/// Shared metrics state with change notification
#[derive(Clone)]
pub struct MetricsHub {
    state: Arc<RwLock<MetricsSnapshot>>,
    listeners: Arc<Listeners>,
}

impl fmt::Debug for MetricsHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsHub")
            .field("state", &*self.state.read())
            .field("listeners", &self.listeners.callbacks.lock().len())
            .finish()
    }
}

impl MetricsHub {
    pub fn new(now_ms: i64, reservoir_tokens: u64) -> Self {
        Self {
            state: Arc::new(RwLock::new(MetricsSnapshot::fresh(now_ms, reservoir_tokens))),
            listeners: Arc::new(Listeners::default()),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.read().clone()
    }

    /// Apply a mutation, then notify every subscriber.
    ///
    /// The write lock is released before callbacks run so they may read
    /// the snapshot.
    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut MetricsSnapshot),
    {
        {
            let mut state = self.state.write();
            mutate(&mut state);
        }
        self.notify();
    }

    /// Replace everything with the zero-state
    pub fn reset(&self, now_ms: i64, reservoir_tokens: u64) {
        self.update(|m| *m = MetricsSnapshot::fresh(now_ms, reservoir_tokens));
    }

    /// Register a change callback
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.callbacks.lock().insert(id, Arc::new(callback));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.callbacks.lock().len()
    }

    fn notify(&self) {
        let callbacks: Vec<Listener> = self.listeners.callbacks.lock().values().cloned().collect();
        for cb in callbacks {
            cb();
        }
    }
}

/// Handle returned by [`MetricsHub::subscribe`]; unsubscribes on drop
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    /// Stop receiving notifications. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.callbacks.lock().remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_latency_ewma() {
        let mut m = MetricsSnapshot::fresh(0, 0);
        m.record_latency(1000);
        assert_eq!(m.avg_latency_ms, 1000);
        m.record_latency(2000);
        assert_eq!(m.avg_latency_ms, 1100);
        assert_eq!(m.last_latency_ms, 2000);
    }

    #[test]
    fn test_subscribers_notified_and_can_read() {
        let hub = MetricsHub::new(0, 10);
        let seen = Arc::new(AtomicUsize::new(0));

        let reader = hub.clone();
        let counter = seen.clone();
        let sub = hub.subscribe(move || {
            counter.store(reader.snapshot().total_requests as usize, Ordering::SeqCst);
        });

        hub.update(|m| m.total_requests += 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        sub.unsubscribe();
        sub.unsubscribe();
        hub.update(|m| m.total_requests += 1);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = MetricsHub::new(0, 0);
        {
            let _sub = hub.subscribe(|| {});
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_reset() {
        let hub = MetricsHub::new(0, 100);
        hub.update(|m| {
            m.failed_requests = 4;
            m.status = HealthStatus::Down;
        });
        hub.reset(5, 80);
        let snap = hub.snapshot();
        assert_eq!(snap.failed_requests, 0);
        assert_eq!(snap.status, HealthStatus::Idle);
        assert_eq!(snap.reservoir_tokens, 80);
        assert_eq!(snap.last_check_timestamp, 5);
    }
}
