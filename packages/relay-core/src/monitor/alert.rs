use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

use super::health::HealthStatus;
use crate::types::RelayerMetrics;
use crate::{Error, Result};

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Alert {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// What alert rules are evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub health: HealthStatus,
    pub metrics: RelayerMetrics,
    pub open_breakers: Vec<String>,
    pub backlog: usize,
}

type Condition = Box<dyn Fn(&MonitorSnapshot) -> bool + Send + Sync>;

/// A named predicate over [`MonitorSnapshot`]. Fires once when the condition
/// turns true and resolves when it turns false again.
pub struct AlertRule {
    pub name: String,
    pub severity: Severity,
    pub message: String,
    condition: Condition,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        condition: impl Fn(&MonitorSnapshot) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            severity,
            message: message.into(),
            condition: Box::new(condition),
        }
    }

    pub fn matches(&self, snapshot: &MonitorSnapshot) -> bool {
        (self.condition)(snapshot)
    }

    /// The rules every relay runs with.
    pub fn defaults(failure_threshold: u64) -> Vec<AlertRule> {
        vec![
            AlertRule::new(
                "relay_unhealthy",
                Severity::Critical,
                "relay health is unhealthy",
                |s| s.health == HealthStatus::Unhealthy,
            ),
            AlertRule::new(
                "message_failures",
                Severity::High,
                format!("{} or more messages failed", failure_threshold),
                move |s| failure_threshold > 0 && s.metrics.messages_failed >= failure_threshold,
            ),
            AlertRule::new(
                "circuit_open",
                Severity::Medium,
                "a circuit breaker is open",
                |s| !s.open_breakers.is_empty(),
            ),
        ]
    }
}

impl fmt::Debug for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .finish()
    }
}

/// Delivery channel for alerts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> String;

    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log at a level matching their severity.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> String {
        "log".to_string()
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical | Severity::High => error!(
                alert_id = %alert.id,
                rule = %alert.rule,
                severity = %alert.severity,
                "ALERT: {}",
                alert.message
            ),
            Severity::Medium => warn!(
                alert_id = %alert.id,
                rule = %alert.rule,
                severity = %alert.severity,
                "ALERT: {}",
                alert.message
            ),
            Severity::Low => info!(
                alert_id = %alert.id,
                rule = %alert.rule,
                severity = %alert.severity,
                "ALERT: {}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// POSTs each alert as JSON to a URL.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build webhook client: {}", e)))?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> String {
        "webhook".to_string()
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "webhook {} returned HTTP {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MonitorSnapshot {
        MonitorSnapshot {
            health: HealthStatus::Healthy,
            metrics: RelayerMetrics::default(),
            open_breakers: vec![],
            backlog: 0,
        }
    }

    fn alert() -> Alert {
        Alert {
            id: "alert-1".to_string(),
            rule: "circuit_open".to_string(),
            severity: Severity::Medium,
            message: "a circuit breaker is open".to_string(),
            created_at: Utc::now(),
            resolved_at: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_default_rules() {
        let rules = AlertRule::defaults(2);
        let fired = |s: &MonitorSnapshot| -> Vec<String> {
            rules.iter().filter(|r| r.matches(s)).map(|r| r.name.clone()).collect()
        };

        assert!(fired(&snapshot()).is_empty());

        let mut s = snapshot();
        s.health = HealthStatus::Unhealthy;
        s.metrics.messages_failed = 2;
        s.open_breakers = vec!["submit:base".to_string()];
        assert_eq!(fired(&s), vec!["relay_unhealthy", "message_failures", "circuit_open"]);
    }

    #[tokio::test]
    async fn test_webhook_posts_alert() {
        let mut server = mockito::Server::new_async().await;
        let hook = server
            .mock("POST", "/alerts")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "rule": "circuit_open",
                "severity": "medium"
            })))
            .with_status(200)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(&format!("{}/alerts", server.url())).unwrap();
        notifier.notify(&alert()).await.unwrap();
        hook.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/").with_status(500).create_async().await;

        let notifier = WebhookNotifier::new(&server.url()).unwrap();
        assert!(matches!(notifier.notify(&alert()).await, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier.notify(&alert()).await.is_ok());
    }
}
