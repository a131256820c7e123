//! Classification-driven retry with admission checks

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::errors::{ErrorKind, Result, TranslationError};
use crate::core::metrics::{HealthStatus, MetricsHub};
use crate::core::reservoir::Reservoir;

/// Backoff settings for one `execute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Fixed wait after a rate limit, matching the upstream's per-minute window
    pub rate_limit_wait: Duration,
    pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            rate_limit_wait: Duration::from_secs(30),
            max_jitter_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            ..Default::default()
        }
    }

    /// Wait before the next attempt (without jitter) and the delay carried after it
    pub fn backoff(&self, kind: ErrorKind, delay: Duration) -> (Duration, Duration) {
        match kind {
            ErrorKind::RateLimited => (self.rate_limit_wait, delay),
            _ => (delay, delay.saturating_mul(2)),
        }
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.max_jitter_ms))
    }
}

/// Sleep unless `cancel` fires first
pub(crate) async fn pause(wait: Duration, cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) => tokio::select! {
            _ = sleep(wait) => Ok(()),
            _ = token.cancelled() => Err(TranslationError::Cancelled),
        },
        None => {
            sleep(wait).await;
            Ok(())
        }
    }
}

/// Wraps upstream calls with admission, bookkeeping and backoff
#[derive(Debug, Clone)]
pub struct RetryEngine {
    reservoir: Reservoir,
    breaker: CircuitBreaker,
    metrics: MetricsHub,
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(
        reservoir: Reservoir,
        breaker: CircuitBreaker,
        metrics: MetricsHub,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            reservoir,
            breaker,
            metrics,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` with the engine's default policy
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.policy;
        self.execute_with(call, &policy, None).await
    }

    /// Run `call` until it succeeds, a non-retryable error occurs, or retries run out
    pub async fn execute_with<T, F, Fut>(
        &self,
        mut call: F,
        policy: &RetryPolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = policy.base_delay;
        let mut retries_left = policy.max_retries;
        let mut attempt = 0u32;

        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(TranslationError::Cancelled);
            }
            self.admit().await?;

            attempt += 1;
            self.metrics.update(|m| m.total_requests += 1);
            let started = Instant::now();

            let err = match call().await {
                Ok(value) => {
                    self.record_success(started.elapsed());
                    if attempt > 1 {
                        info!("Upstream call succeeded after {} retries", attempt - 1);
                    }
                    return Ok(value);
                }
                Err(TranslationError::Cancelled) => return Err(TranslationError::Cancelled),
                Err(err) => err,
            };

            let kind = err.kind();
            self.record_failure(kind, &err);

            if retries_left == 0 || !kind.is_retryable() {
                debug!("Giving up after {} attempts: {}", attempt, err);
                return Err(err);
            }

            let (wait, next_delay) = policy.backoff(kind, delay);
            let wait = if kind == ErrorKind::RateLimited {
                warn!("Quota exceeded. Pausing for {:?} before retry", wait);
                wait
            } else {
                let wait = wait + policy.jitter();
                warn!("{}. Retrying in {:?}", kind, wait);
                wait
            };

            pause(wait, cancel).await?;
            delay = next_delay;
            retries_left -= 1;
        }
    }

    /// Fail fast when the reservoir is empty or the breaker is open
    pub async fn admit(&self) -> Result<()> {
        if self.reservoir.is_exhausted().await {
            return Err(TranslationError::QuotaExhausted);
        }
        if !self.breaker.admit() {
            return Err(TranslationError::CircuitOpen);
        }
        Ok(())
    }

    pub(crate) fn record_success(&self, latency: Duration) {
        self.breaker.record_success();
        let latency_ms = latency.as_millis() as u64;
        self.metrics.update(|m| {
            m.successful_requests += 1;
            m.record_latency(latency_ms);
            m.status = if m.status == HealthStatus::Down {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };
            m.last_error = None;
        });
    }

    pub(crate) fn record_failure(&self, kind: ErrorKind, err: &TranslationError) {
        if kind.charges_breaker() {
            self.breaker.record_failure();
            let message = err.to_string();
            self.metrics.update(|m| {
                m.failed_requests += 1;
                m.status = HealthStatus::Down;
                m.last_error = Some(message);
            });
        } else {
            self.metrics.update(|m| {
                m.rate_limit_count += 1;
                m.status = HealthStatus::Degraded;
                m.last_error = Some("Rate Limit (429)".to_string());
            });
        }
    }
}
