//! Per-operation circuit breakers.
//!
//! A breaker fails fast while a destination is known to be unhealthy and lets a
//! single probe through once the reset timeout has elapsed.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow through.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// One probe call is allowed to test recovery.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Gauge value (0=Closed, 1=Open, 2=HalfOpen).
    pub fn as_metric_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

/// Point-in-time view of one breaker for the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub open_count: u64,
    pub rejected_count: u64,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    reset_timeout: Duration,
    inner: RwLock<BreakerInner>,
    open_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            max_failures: max_failures.max(1),
            reset_timeout,
            inner: RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                last_failure_at: None,
                probe_in_flight: false,
            }),
            open_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.read().state
    }

    pub fn failures(&self) -> u32 {
        self.inner.read().failures
    }

    /// Whether a call may proceed now. Moves an expired `Open` breaker to
    /// `HalfOpen` and hands out its single probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let expired = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.reset_timeout);
                if expired {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "circuit breaker half-open, allowing probe");
                    true
                } else {
                    self.rejected_count.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    self.rejected_count.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.write();
        if inner.state != BreakerState::Closed {
            info!(breaker = %self.name, "circuit breaker closed, destination recovered");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.probe_in_flight = false;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.write();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.probe_in_flight = false;

        match inner.state {
            BreakerState::Closed if inner.failures >= self.max_failures => {
                inner.state = BreakerState::Open;
                self.open_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    breaker = %self.name,
                    failures = inner.failures,
                    "circuit breaker opened after consecutive failures"
                );
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                self.open_count.fetch_add(1, Ordering::Relaxed);
                warn!(breaker = %self.name, "probe failed, circuit breaker re-opened");
            }
            _ => {}
        }
    }

    /// Gives back a probe whose call ended without an outcome, e.g. on shutdown.
    pub fn release_probe(&self) {
        let mut inner = self.inner.write();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.read();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            last_failure: inner.last_failure_at,
            open_count: self.open_count.load(Ordering::Relaxed),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
        }
    }
}

/// Breakers keyed by operation name, created on first use.
pub struct BreakerRegistry {
    max_failures: u32,
    reset_timeout: Duration,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            max_failures: config.max_failures,
            reset_timeout: config.reset_timeout(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, operation: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(operation) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, self.max_failures, self.reset_timeout)))
            .clone()
    }

    pub fn get(&self, operation: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(operation).cloned()
    }

    /// Snapshot of every breaker, ordered by name.
    pub fn stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<_> = self.breakers.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn open_breakers(&self) -> Vec<String> {
        let mut open: Vec<_> = self
            .breakers
            .read()
            .values()
            .filter(|b| b.state() == BreakerState::Open)
            .map(|b| b.name().to_string())
            .collect();
        open.sort();
        open
    }
}
