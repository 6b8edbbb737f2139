//! Prometheus metrics for route synchronization and dispatch

use anyhow::Result;
use fleet_core::HealthStats;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics collector shared by the sync layer and the gateway.
///
/// Clones share the same underlying registry and metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    /// Registry events consumed, by kind
    pub registry_events_total: IntCounterVec,
    /// Route replacements pushed to the routing table
    pub route_updates_total: IntCounter,
    /// Routes removed because no healthy target remained
    pub route_removals_total: IntCounter,
    /// Malformed targets and rejected route updates
    pub route_errors_total: IntCounter,
    /// Routes currently installed
    pub routes: IntGauge,
    /// Dispatched requests by outcome
    pub proxy_requests_total: IntCounterVec,
    /// Upstream latency in seconds
    pub proxy_request_duration_seconds: HistogramVec,
    pub health_probes_total: IntGauge,
    pub health_failures_total: IntGauge,
    pub health_timeouts_total: IntGauge,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let registry_events_total = IntCounterVec::new(
            Opts::new("fleet_registry_events_total", "Registry events consumed"),
            &["kind"],
        )?;
        let route_updates_total =
            IntCounter::new("fleet_route_updates_total", "Route target set replacements")?;
        let route_removals_total =
            IntCounter::new("fleet_route_removals_total", "Routes removed when emptied")?;
        let route_errors_total =
            IntCounter::new("fleet_route_errors_total", "Rejected targets and route updates")?;
        let routes = IntGauge::new("fleet_routes", "Routes currently installed")?;

        let proxy_requests_total = IntCounterVec::new(
            Opts::new("fleet_proxy_requests_total", "Dispatched requests by outcome"),
            &["outcome"],
        )?;
        let proxy_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "fleet_proxy_request_duration_seconds",
                "Upstream request latency in seconds",
            ),
            &["outcome"],
        )?;

        let health_probes_total =
            IntGauge::new("fleet_health_probes_total", "Health probes executed")?;
        let health_failures_total =
            IntGauge::new("fleet_health_failures_total", "Health probes that failed")?;
        let health_timeouts_total =
            IntGauge::new("fleet_health_timeouts_total", "Health probes that timed out")?;

        registry.register(Box::new(registry_events_total.clone()))?;
        registry.register(Box::new(route_updates_total.clone()))?;
        registry.register(Box::new(route_removals_total.clone()))?;
        registry.register(Box::new(route_errors_total.clone()))?;
        registry.register(Box::new(routes.clone()))?;
        registry.register(Box::new(proxy_requests_total.clone()))?;
        registry.register(Box::new(proxy_request_duration_seconds.clone()))?;
        registry.register(Box::new(health_probes_total.clone()))?;
        registry.register(Box::new(health_failures_total.clone()))?;
        registry.register(Box::new(health_timeouts_total.clone()))?;

        Ok(Self {
            registry_events_total,
            route_updates_total,
            route_removals_total,
            route_errors_total,
            routes,
            proxy_requests_total,
            proxy_request_duration_seconds,
            health_probes_total,
            health_failures_total,
            health_timeouts_total,
            registry,
        })
    }

    /// Mirror the health checker's counters
    pub fn observe_health(&self, stats: &HealthStats) {
        self.health_probes_total.set(stats.probes as i64);
        self.health_failures_total.set(stats.failures as i64);
        self.health_timeouts_total.set(stats.timeouts as i64);
    }

    /// Record one dispatched request
    pub fn observe_request(&self, outcome: &str, seconds: f64) {
        self.proxy_requests_total.with_label_values(&[outcome]).inc();
        self.proxy_request_duration_seconds
            .with_label_values(&[outcome])
            .observe(seconds);
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
