use prometheus::{Counter, CounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus counters for the gateway: admitted and rejected requests,
/// renderer usage, and swallowed audit-write failures.
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    subscribe_requests_total: Counter,
    rejections_total: CounterVec,
    renders_total: CounterVec,
    audit_write_failures: Counter,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let subscribe_requests_total = Counter::new(
            "gateway_subscribe_requests_total",
            "Admitted subscribe requests",
        )?;
        registry.register(Box::new(subscribe_requests_total.clone()))?;

        let rejections_total = CounterVec::new(
            Opts::new("gateway_rejections_total", "Rejected requests by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let renders_total = CounterVec::new(
            Opts::new("gateway_renders_total", "Rendered responses by renderer"),
            &["renderer"],
        )?;
        registry.register(Box::new(renders_total.clone()))?;

        let audit_write_failures = Counter::new(
            "gateway_audit_write_failures_total",
            "Audit log writes that failed and were swallowed",
        )?;
        registry.register(Box::new(audit_write_failures.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            subscribe_requests_total,
            rejections_total,
            renders_total,
            audit_write_failures,
        })
    }

    pub fn record_subscribe(&self) {
        self.subscribe_requests_total.inc();
    }

    pub fn record_rejection(&self, reason: &str) {
        self.rejections_total.with_label_values(&[reason]).inc();
    }

    pub fn record_render(&self, renderer: &str) {
        self.renders_total.with_label_values(&[renderer]).inc();
    }

    pub fn record_audit_failure(&self) {
        self.audit_write_failures.inc();
    }

    pub fn render_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics collector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = MetricsCollector::new().unwrap();

        metrics.record_subscribe();
        metrics.record_rejection("blocked");
        metrics.record_rejection("rate_limited_user");
        metrics.record_render("general");
        metrics.record_audit_failure();

        let report = metrics.render_metrics().unwrap();
        assert!(report.contains("gateway_subscribe_requests_total"));
        assert!(report.contains("gateway_rejections_total"));
    }
}
