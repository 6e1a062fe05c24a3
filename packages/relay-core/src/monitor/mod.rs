//! Lifecycle event recording, health checks and alerting.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::resilience::BreakerRegistry;
use crate::types::{MessageKind, MessageStatus, RelayerMetrics};
use crate::Result;

pub mod alert;
pub mod health;
pub mod metrics;

pub use alert::{Alert, AlertRule, LogNotifier, MonitorSnapshot, Notifier, Severity, WebhookNotifier};
pub use health::{
    BacklogHealthCheck, BreakerHealthCheck, CheckResult, HealthCheck, HealthReport, HealthStatus, LedgerHealthCheck,
    NamedCheck,
};
pub use metrics::PrometheusMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    /// A message moved between states; `status` is the new state.
    Transition,
    SubmissionAttempt,
    Confirmation,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub at: DateTime<Utc>,
    pub event_type: LifecycleEventType,
    pub message_id: String,
    pub chain: String,
    pub kind: MessageKind,
    /// Metric label: a state name, `attempt`, or an error label.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl LifecycleEvent {
    pub fn transition(message_id: &str, chain: &str, kind: MessageKind, status: MessageStatus, reason: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            event_type: LifecycleEventType::Transition,
            message_id: message_id.to_string(),
            chain: chain.to_string(),
            kind,
            outcome: status.as_str().to_lowercase(),
            status: Some(status),
            detail: reason,
            latency_ms: None,
        }
    }

    /// Time the message took from creation to this event.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    pub fn attempt(message_id: &str, chain: &str, kind: MessageKind, attempt: u32) -> Self {
        Self {
            at: Utc::now(),
            event_type: LifecycleEventType::SubmissionAttempt,
            message_id: message_id.to_string(),
            chain: chain.to_string(),
            kind,
            outcome: "attempt".to_string(),
            status: None,
            detail: Some(format!("attempt {}", attempt + 1)),
            latency_ms: None,
        }
    }

    pub fn confirmation(message_id: &str, chain: &str, kind: MessageKind, tx_hash: &str, latency: Duration) -> Self {
        Self {
            at: Utc::now(),
            event_type: LifecycleEventType::Confirmation,
            message_id: message_id.to_string(),
            chain: chain.to_string(),
            kind,
            outcome: "confirmed".to_string(),
            status: None,
            detail: Some(tx_hash.to_string()),
            latency_ms: Some(latency.as_millis() as u64),
        }
    }

    pub fn error(message_id: &str, chain: &str, kind: MessageKind, err: &crate::Error) -> Self {
        Self {
            at: Utc::now(),
            event_type: LifecycleEventType::Error,
            message_id: message_id.to_string(),
            chain: chain.to_string(),
            kind,
            outcome: err.label().to_string(),
            status: None,
            detail: Some(err.to_string()),
            latency_ms: None,
        }
    }
}

#[derive(Default)]
struct MetricsState {
    metrics: RelayerMetrics,
    latency_total_ms: u128,
    latency_samples: u64,
}

struct AlertState {
    history: VecDeque<Alert>,
    active: HashMap<String, String>,
}

pub struct Monitor {
    buffer_size: usize,
    health_interval: Duration,
    report_interval: Duration,
    events: Mutex<VecDeque<LifecycleEvent>>,
    prometheus: PrometheusMetrics,
    state: RwLock<MetricsState>,
    backlog: Arc<AtomicUsize>,
    breakers: Arc<BreakerRegistry>,
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    health: RwLock<HealthReport>,
    rules: RwLock<Vec<AlertRule>>,
    alerts: Mutex<AlertState>,
    notifiers: RwLock<Vec<Arc<dyn Notifier>>>,
    /// In-flight notifier calls.
    notifications: TaskTracker,
    alert_seq: AtomicU64,
}

impl Monitor {
    /// A monitor with the built-in breaker and backlog checks, the default
    /// alert rules and a [`LogNotifier`].
    pub fn new(config: &MonitorConfig, breakers: Arc<BreakerRegistry>) -> Result<Self> {
        let backlog = Arc::new(AtomicUsize::new(0));
        let checks: Vec<Arc<dyn HealthCheck>> = vec![
            Arc::new(BreakerHealthCheck::new(breakers.clone())),
            Arc::new(BacklogHealthCheck::new(backlog.clone(), config.queue_backlog_threshold)),
        ];
        let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = &config.webhook_url {
            notifiers.push(Arc::new(WebhookNotifier::new(url)?));
        }

        Ok(Self {
            buffer_size: config.event_buffer_size.max(1),
            health_interval: config.health_check_interval(),
            report_interval: config.metrics_report_interval(),
            events: Mutex::new(VecDeque::with_capacity(config.event_buffer_size.min(1024))),
            prometheus: PrometheusMetrics::new()?,
            state: RwLock::new(MetricsState::default()),
            backlog,
            breakers,
            checks: RwLock::new(checks),
            health: RwLock::new(HealthReport::default()),
            rules: RwLock::new(AlertRule::defaults(config.failure_alert_threshold)),
            alerts: Mutex::new(AlertState {
                history: VecDeque::new(),
                active: HashMap::new(),
            }),
            notifiers: RwLock::new(notifiers),
            notifications: TaskTracker::new(),
            alert_seq: AtomicU64::new(0),
        })
    }

    pub fn add_health_check(&self, check: Arc<dyn HealthCheck>) {
        self.checks.write().push(check);
    }

    pub fn add_alert_rule(&self, rule: AlertRule) {
        self.rules.write().push(rule);
    }

    pub fn add_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.notifiers.write().push(notifier);
    }

    /// Records a lifecycle event into the ring buffer, the prometheus counters
    /// and the aggregate relay metrics. A failed message re-evaluates the
    /// alert rules straight away.
    pub fn record(&self, event: LifecycleEvent) {
        self.prometheus
            .lifecycle_events
            .with_label_values(&[&event.chain, event.kind.as_str(), &event.outcome])
            .inc();

        let failed = event.event_type == LifecycleEventType::Transition && event.status == Some(MessageStatus::Failed);
        if let (LifecycleEventType::Transition, Some(status), Some(latency_ms)) =
            (event.event_type, event.status, event.latency_ms)
        {
            if status.is_terminal() {
                self.prometheus
                    .message_latency_seconds
                    .with_label_values(&[&event.chain, event.kind.as_str(), &event.outcome])
                    .observe(latency_ms as f64 / 1000.0);
            }
        }

        {
            let mut state = self.state.write();
            match (event.event_type, event.status) {
                (LifecycleEventType::SubmissionAttempt, _) => {
                    state.metrics.messages_processed += 1;
                    state.metrics.last_processed_time = Some(event.at);
                }
                (LifecycleEventType::Transition, Some(MessageStatus::Sent)) => state.metrics.messages_sent += 1,
                (LifecycleEventType::Transition, Some(MessageStatus::Confirmed)) => {
                    state.metrics.messages_confirmed += 1
                }
                (LifecycleEventType::Transition, Some(MessageStatus::Failed)) => state.metrics.messages_failed += 1,
                (LifecycleEventType::Confirmation, _) => {
                    if let Some(latency_ms) = event.latency_ms {
                        state.latency_total_ms += latency_ms as u128;
                        state.latency_samples += 1;
                        state.metrics.average_latency_ms =
                            (state.latency_total_ms / state.latency_samples as u128) as u64;
                    }
                }
                _ => {}
            }
        }

        {
            let mut events = self.events.lock();
            if events.len() >= self.buffer_size {
                events.pop_front();
            }
            events.push_back(event);
        }

        if failed {
            self.evaluate_alerts();
        }
    }

    /// The most recent `limit` events, newest last.
    pub fn recent_events(&self, limit: usize) -> Vec<LifecycleEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn metrics(&self) -> RelayerMetrics {
        self.state.read().metrics.clone()
    }

    pub fn set_backlog(&self, backlog: usize) {
        self.backlog.store(backlog, Ordering::Relaxed);
        self.prometheus.backlog.set(backlog as i64);
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> HealthReport {
        self.health.read().clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().history.iter().cloned().collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .history
            .iter()
            .filter(|a| !a.is_resolved())
            .cloned()
            .collect()
    }

    pub fn encode_prometheus(&self) -> Result<String> {
        for stats in self.breakers.stats() {
            self.prometheus
                .breaker_state
                .with_label_values(&[&stats.name])
                .set(stats.state.as_metric_value());
        }
        self.prometheus.encode()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            health: self.health.read().status,
            metrics: self.metrics(),
            open_breakers: self.breakers.open_breakers(),
            backlog: self.backlog(),
        }
    }

    /// Runs every registered check, stores the report and evaluates alert rules.
    pub async fn run_health_checks(&self) -> HealthReport {
        let checks: Vec<_> = self.checks.read().clone();
        let mut results = Vec::with_capacity(checks.len());

        for check in checks {
            let started = Instant::now();
            let result = check.check().await;
            let name = check.name();
            if result.status != HealthStatus::Healthy {
                warn!(check = %name, status = result.status.as_str(), message = %result.message, "health check not healthy");
            }
            self.prometheus
                .health_status
                .with_label_values(&[&name])
                .set(result.status.as_metric_value());
            results.push(NamedCheck {
                name,
                status: result.status,
                message: result.message,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let report = HealthReport::from_checks(results);
        debug!(status = report.status.as_str(), checks = report.checks.len(), "health checks complete");
        *self.health.write() = report.clone();
        self.evaluate_alerts();
        report
    }

    /// Fires alerts for rules whose condition just turned true and resolves
    /// the ones whose condition cleared. Returns the newly fired alerts.
    pub(crate) fn evaluate_alerts(&self) -> Vec<Alert> {
        let snapshot = self.snapshot();
        let mut fired = Vec::new();
        {
            let rules = self.rules.read();
            let mut alerts = self.alerts.lock();
            for rule in rules.iter() {
                let matching = rule.matches(&snapshot);
                match (matching, alerts.active.get(&rule.name).cloned()) {
                    (true, None) => {
                        let alert = Alert {
                            id: format!("alert-{}", self.alert_seq.fetch_add(1, Ordering::Relaxed) + 1),
                            rule: rule.name.clone(),
                            severity: rule.severity,
                            message: rule.message.clone(),
                            created_at: Utc::now(),
                            resolved_at: None,
                            metadata: HashMap::from([
                                ("health".to_string(), snapshot.health.as_str().to_string()),
                                ("messages_failed".to_string(), snapshot.metrics.messages_failed.to_string()),
                                ("open_breakers".to_string(), snapshot.open_breakers.join(",")),
                                ("backlog".to_string(), snapshot.backlog.to_string()),
                            ]),
                        };
                        alerts.active.insert(rule.name.clone(), alert.id.clone());
                        alerts.history.push_back(alert.clone());
                        if alerts.history.len() > self.buffer_size {
                            alerts.history.pop_front();
                        }
                        fired.push(alert);
                    }
                    (false, Some(alert_id)) => {
                        alerts.active.remove(&rule.name);
                        if let Some(alert) = alerts.history.iter_mut().find(|a| a.id == alert_id) {
                            alert.resolved_at = Some(Utc::now());
                        }
                        info!(rule = %rule.name, alert_id = %alert_id, "alert resolved");
                    }
                    _ => {}
                }
            }
        }

        for alert in &fired {
            self.dispatch(alert);
        }
        fired
    }

    /// Sends `alert` to every notifier without waiting on any of them. Outside
    /// a tokio runtime the alert is only recorded.
    fn dispatch(&self, alert: &Alert) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(alert_id = %alert.id, rule = %alert.rule, "no runtime to notify on, alert recorded only");
            return;
        };
        let notifiers: Vec<_> = self.notifiers.read().clone();
        for notifier in notifiers {
            let alert = alert.clone();
            self.notifications.spawn_on(
                async move {
                    if let Err(e) = notifier.notify(&alert).await {
                        warn!(notifier = %notifier.name(), alert_id = %alert.id, error = %e, "failed to send alert");
                    }
                },
                &runtime,
            );
        }
    }

    /// Waits for notifier calls already dispatched, up to `timeout`. Returns
    /// false if some were still running.
    pub async fn flush_notifications(&self, timeout: Duration) -> bool {
        self.notifications.close();
        let drained = tokio::time::timeout(timeout, self.notifications.wait()).await.is_ok();
        self.notifications.reopen();
        drained
    }

    /// Spawns the health check loop and the periodic metrics reporter.
    pub fn start(self: &Arc<Self>, token: &CancellationToken, tracker: &TaskTracker) {
        let monitor = self.clone();
        let health_token = token.child_token();
        tracker.spawn(async move {
            let mut ticker = interval_at(Instant::now() + monitor.health_interval, monitor.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = health_token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.run_health_checks().await;
                    }
                }
            }
            debug!("health check loop exited");
        });

        let monitor = self.clone();
        let report_token = token.child_token();
        tracker.spawn(async move {
            let mut ticker = interval_at(Instant::now() + monitor.report_interval, monitor.report_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = report_token.cancelled() => break,
                    _ = ticker.tick() => monitor.report_metrics(),
                }
            }
            debug!("metrics reporter exited");
        });
    }

    pub fn report_metrics(&self) {
        let metrics = self.metrics();
        info!(
            processed = metrics.messages_processed,
            sent = metrics.messages_sent,
            confirmed = metrics.messages_confirmed,
            failed = metrics.messages_failed,
            average_latency_ms = metrics.average_latency_ms,
            backlog = self.backlog(),
            health = self.health.read().status.as_str(),
            "relayer metrics"
        );
    }
}
