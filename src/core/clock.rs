//! Wall-clock source for timestamps and calendar-day checks

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{Local, TimeZone};

/// Milliseconds since the Unix epoch
pub trait Clock: Send + Sync + Debug {
    fn now_ms(&self) -> i64;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// True when both timestamps fall on the same local calendar day
pub fn same_local_day(a_ms: i64, b_ms: i64) -> bool {
    match (
        Local.timestamp_millis_opt(a_ms).single(),
        Local.timestamp_millis_opt(b_ms).single(),
    ) {
        (Some(a), Some(b)) => a.date_naive() == b.date_naive(),
        _ => false,
    }
}
