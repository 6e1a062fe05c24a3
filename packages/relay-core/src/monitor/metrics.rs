//! Prometheus metrics for the relay

use prometheus::{
    histogram_opts, opts, Encoder, GaugeVec, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

use crate::{Error, Result};

/// Collectors for one relay instance, on their own registry so that several
/// relays can live in one process.
pub struct PrometheusMetrics {
    registry: Registry,
    /// Lifecycle events (by chain, message kind, outcome)
    pub lifecycle_events: IntCounterVec,
    /// Creation to terminal state latency (by chain, message kind, outcome)
    pub message_latency_seconds: HistogramVec,
    /// Non-terminal messages in the outbox
    pub backlog: IntGauge,
    /// Circuit breaker state (0=closed, 1=open, 2=half-open)
    pub breaker_state: GaugeVec,
    /// Health check status (0=healthy, 1=degraded, 2=unhealthy)
    pub health_status: GaugeVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("relay".to_string()), None).map_err(metrics_error)?;

        let lifecycle_events = IntCounterVec::new(
            opts!("lifecycle_events_total", "Message lifecycle events"),
            &["chain", "kind", "outcome"],
        )
        .map_err(metrics_error)?;
        let message_latency_seconds = HistogramVec::new(
            histogram_opts!(
                "message_latency_seconds",
                "Time from message creation to confirmed or failed",
                vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
            ),
            &["chain", "kind", "outcome"],
        )
        .map_err(metrics_error)?;
        let backlog = IntGauge::new("backlog", "Non-terminal messages in the outbox").map_err(metrics_error)?;
        let breaker_state = GaugeVec::new(opts!("circuit_breaker_state", "Circuit breaker state"), &["operation"])
            .map_err(metrics_error)?;
        let health_status =
            GaugeVec::new(opts!("health_status", "Health check status"), &["check"]).map_err(metrics_error)?;

        registry
            .register(Box::new(lifecycle_events.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(message_latency_seconds.clone()))
            .map_err(metrics_error)?;
        registry.register(Box::new(backlog.clone())).map_err(metrics_error)?;
        registry.register(Box::new(breaker_state.clone())).map_err(metrics_error)?;
        registry.register(Box::new(health_status.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            lifecycle_events,
            message_latency_seconds,
            backlog,
            breaker_state,
            health_status,
        })
    }

    /// Text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Config(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_prefix_and_labels() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics
            .lifecycle_events
            .with_label_values(&["base", "LOAN_DISBURSEMENT", "confirmed"])
            .inc();
        metrics.backlog.set(3);

        let text = metrics.encode().unwrap();
        assert!(text.contains("relay_lifecycle_events_total{chain=\"base\",kind=\"LOAN_DISBURSEMENT\",outcome=\"confirmed\"} 1"));
        assert!(text.contains("relay_backlog 3"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = PrometheusMetrics::new().unwrap();
        let b = PrometheusMetrics::new().unwrap();
        a.backlog.set(5);
        assert_eq!(b.backlog.get(), 0);
    }
}
