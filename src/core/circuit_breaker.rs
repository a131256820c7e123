//! Consecutive-failure circuit breaker with timed cooldown

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::core::clock::Clock;
use crate::core::metrics::MetricsHub;

/// Consecutive hard failures that open the breaker
pub const FAILURE_THRESHOLD: u32 = 5;

/// Time after the last failure before an open breaker admits again
pub const COOLDOWN_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub last_failure: i64,
    pub is_open: bool,
}

/// Breaker state shared across request paths
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<CircuitState>>,
    clock: Arc<dyn Clock>,
    metrics: MetricsHub,
    threshold: u32,
    cooldown_ms: i64,
}

impl CircuitBreaker {
    pub fn new(clock: Arc<dyn Clock>, metrics: MetricsHub) -> Self {
        Self {
            state: Arc::new(Mutex::new(CircuitState::default())),
            clock,
            metrics,
            threshold: FAILURE_THRESHOLD,
            cooldown_ms: COOLDOWN_MS,
        }
    }

    /// Whether a new upstream call may start.
    ///
    /// An open breaker whose cooldown has elapsed closes here.
    pub fn admit(&self) -> bool {
        {
            let mut state = self.state.lock();
            if !state.is_open {
                return true;
            }
            if self.clock.now_ms() - state.last_failure < self.cooldown_ms {
                return false;
            }
            state.is_open = false;
            state.consecutive_failures = 0;
        }

        info!("Circuit breaker cooldown elapsed, closing");
        self.metrics.update(|m| m.is_circuit_open = false);
        true
    }

    /// Charge one hard failure. Never call this for rate limits.
    pub fn record_failure(&self) {
        let opened = {
            let mut state = self.state.lock();
            state.consecutive_failures += 1;
            state.last_failure = self.clock.now_ms();
            let opened = !state.is_open && state.consecutive_failures >= self.threshold;
            if state.consecutive_failures >= self.threshold {
                state.is_open = true;
            }
            opened
        };

        if opened {
            warn!(
                "Circuit breaker opened after {} consecutive failures",
                self.threshold
            );
            self.metrics.update(|m| m.is_circuit_open = true);
        }
    }

    pub fn record_success(&self) {
        let was_open = {
            let mut state = self.state.lock();
            let was_open = state.is_open;
            state.consecutive_failures = 0;
            state.is_open = false;
            was_open
        };

        if was_open {
            self.metrics.update(|m| m.is_circuit_open = false);
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open
    }
}
