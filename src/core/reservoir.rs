//! Daily token reservoir with calendar-day refill

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::clock::{same_local_day, Clock};
use crate::core::metrics::MetricsHub;
use crate::core::models::TokenReservoir;
use crate::core::store::KeyValueStore;

/// Storage key of the persisted reservoir record
pub const RESERVOIR_KEY: &str = "token_reservoir";

/// Default daily capacity
pub const DEFAULT_CAPACITY: u64 = 500_000;

/// Token reservoir shared by every request path
#[derive(Debug, Clone)]
pub struct Reservoir {
    state: Arc<RwLock<TokenReservoir>>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    capacity: u64,
    metrics: Option<MetricsHub>,
}

impl Reservoir {
    /// Load persisted state; anything missing or unreadable yields a full reservoir
    pub fn load(capacity: u64, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        let state = match store.get(RESERVOIR_KEY) {
            Some(raw) => match serde_json::from_str::<TokenReservoir>(&raw) {
                Ok(saved) => refill_if_new_day(saved, capacity, now),
                Err(e) => {
                    warn!("Failed to load reservoir: {}", e);
                    TokenReservoir::full(capacity, now)
                }
            },
            None => TokenReservoir::full(capacity, now),
        };

        let reservoir = Self {
            state: Arc::new(RwLock::new(state)),
            store,
            clock,
            capacity,
            metrics: None,
        };
        reservoir.persist(&state);
        debug!("Reservoir loaded: {}/{} tokens", state.remaining, state.capacity);
        reservoir
    }

    /// Publish the level to `metrics` whenever a new day refills the reservoir
    pub fn with_metrics(mut self, metrics: MetricsHub) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Remove up to `tokens`, flooring at zero. `total_consumed` always grows by `tokens`.
    pub async fn consume(&self, tokens: u64) -> TokenReservoir {
        let snapshot = {
            let mut state = self.state.write().await;
            self.reset_if_needed(&mut state);
            state.remaining = state.remaining.saturating_sub(tokens);
            state.total_consumed = state.total_consumed.saturating_add(tokens);
            *state
        };

        self.persist(&snapshot);
        debug!("Used {} tokens, remaining: {}", tokens, snapshot.remaining);
        snapshot
    }

    /// State as last written, without waiting; `None` while a writer holds the lock
    pub fn peek(&self) -> Option<TokenReservoir> {
        self.state.try_read().ok().map(|state| *state)
    }

    /// Current state, refreshed across a day boundary
    pub async fn snapshot(&self) -> TokenReservoir {
        let mut state = self.state.write().await;
        if self.reset_if_needed(&mut state) {
            self.persist(&state);
        }
        *state
    }

    pub async fn remaining(&self) -> u64 {
        self.snapshot().await.remaining
    }

    pub async fn is_exhausted(&self) -> bool {
        self.snapshot().await.is_exhausted()
    }

    fn reset_if_needed(&self, state: &mut TokenReservoir) -> bool {
        let now = self.clock.now_ms();
        if same_local_day(state.last_refill, now) {
            return false;
        }
        *state = refill_if_new_day(*state, self.capacity, now);
        if let Some(metrics) = &self.metrics {
            let remaining = state.remaining;
            metrics.update(|m| m.reservoir_tokens = remaining);
        }
        true
    }

    fn persist(&self, state: &TokenReservoir) {
        match serde_json::to_string(state) {
            Ok(json) => self.store.set(RESERVOIR_KEY, &json),
            Err(e) => warn!("Failed to persist reservoir: {}", e),
        }
    }
}

fn refill_if_new_day(saved: TokenReservoir, capacity: u64, now: i64) -> TokenReservoir {
    if same_local_day(saved.last_refill, now) {
        return TokenReservoir {
            remaining: saved.remaining.min(saved.capacity),
            ..saved
        };
    }

    info!("New day, token reservoir refilled to {}", capacity);
    TokenReservoir {
        capacity,
        remaining: capacity,
        last_refill: now,
        total_consumed: saved.total_consumed,
    }
}
