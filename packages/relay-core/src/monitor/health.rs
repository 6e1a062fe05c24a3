use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::chain_adapter::LedgerClient;
use crate::resilience::BreakerRegistry;

/// Ordered from best to worst so that the overall status is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn as_metric_value(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 0.0,
            HealthStatus::Degraded => 1.0,
            HealthStatus::Unhealthy => 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    pub message: String,
}

impl CheckResult {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: message.into(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> String;

    async fn check(&self) -> CheckResult;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<NamedCheck>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
            checked_at: None,
        }
    }
}

impl HealthReport {
    pub fn from_checks(checks: Vec<NamedCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            checks,
            checked_at: Some(Utc::now()),
        }
    }
}

/// Degraded while any breaker is open.
pub struct BreakerHealthCheck {
    breakers: Arc<BreakerRegistry>,
}

impl BreakerHealthCheck {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl HealthCheck for BreakerHealthCheck {
    fn name(&self) -> String {
        "circuit_breakers".to_string()
    }

    async fn check(&self) -> CheckResult {
        let open = self.breakers.open_breakers();
        if open.is_empty() {
            CheckResult::healthy("all circuit breakers closed")
        } else {
            CheckResult::degraded(format!("open circuit breakers: {}", open.join(", ")))
        }
    }
}

/// Degraded while more non-terminal messages are queued than `threshold`.
pub struct BacklogHealthCheck {
    backlog: Arc<AtomicUsize>,
    threshold: usize,
}

impl BacklogHealthCheck {
    pub fn new(backlog: Arc<AtomicUsize>, threshold: usize) -> Self {
        Self { backlog, threshold }
    }
}

#[async_trait]
impl HealthCheck for BacklogHealthCheck {
    fn name(&self) -> String {
        "queue_backlog".to_string()
    }

    async fn check(&self) -> CheckResult {
        let backlog = self.backlog.load(Ordering::Relaxed);
        if backlog > self.threshold {
            CheckResult::degraded(format!("{} messages outstanding (threshold {})", backlog, self.threshold))
        } else {
            CheckResult::healthy(format!("{} messages outstanding", backlog))
        }
    }
}

/// Unhealthy when a destination ledger does not answer a block-height query.
pub struct LedgerHealthCheck {
    chain: String,
    client: Arc<dyn LedgerClient>,
    timeout: Duration,
}

impl LedgerHealthCheck {
    pub fn new(chain: &str, client: Arc<dyn LedgerClient>) -> Self {
        Self {
            chain: chain.to_string(),
            client,
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl HealthCheck for LedgerHealthCheck {
    fn name(&self) -> String {
        format!("ledger:{}", self.chain)
    }

    async fn check(&self) -> CheckResult {
        match tokio::time::timeout(self.timeout, self.client.block_number()).await {
            Ok(Ok(height)) => CheckResult::healthy(format!("block height {}", height)),
            Ok(Err(e)) => CheckResult::unhealthy(format!("{} unreachable: {}", self.chain, e)),
            Err(_) => CheckResult::unhealthy(format!("{} did not answer within {:?}", self.chain, self.timeout)),
        }
    }
}
