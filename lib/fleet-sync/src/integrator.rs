//! Keeps the proxy routing table in step with registry events

use crate::metric::ServiceMetricData;
use chrono::Utc;
use fleet_core::{EventStream, ServiceEvent, ServiceInstance, ServiceRegistry};
use fleet_proxy::{MetricsCollector, RoutingTable, Target};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Integrator settings
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// How often availability time is accrued without an event
    pub metrics_interval: Duration,
    /// Passed through to every route update
    pub load_balancing_enabled: bool,
    /// How long metrics of a removed instance are kept
    pub metrics_retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(30),
            load_balancing_enabled: true,
            metrics_retention: Duration::from_secs(3600),
        }
    }
}

/// Counters describing the integrator's work so far
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub events_processed: u64,
    pub route_updates: u64,
    pub route_removals: u64,
    pub route_errors: u64,
}

#[derive(Default)]
struct SyncState {
    /// Service name to bound path patterns
    route_map: HashMap<String, BTreeSet<String>>,
    /// Instance id to latest snapshot
    service_map: HashMap<String, ServiceInstance>,
    metrics: HashMap<String, ServiceMetricData>,
    stats: SyncStats,
}

/// Consumes the registry's event stream and rewrites routes so that each
/// service's route targets exactly its Up instances.
pub struct ProxyDiscoveryIntegrator {
    table: Arc<RoutingTable>,
    config: SyncConfig,
    collector: Option<MetricsCollector>,
    state: Mutex<SyncState>,
    events: Mutex<Option<EventStream>>,
    /// Sequence of the last event reflected in the seed snapshot
    seeded_through: u64,
}

impl ProxyDiscoveryIntegrator {
    /// Subscribe to `registry` and install routes for instances it already holds
    pub async fn new(
        registry: &ServiceRegistry,
        table: Arc<RoutingTable>,
        config: SyncConfig,
        collector: Option<MetricsCollector>,
    ) -> Self {
        let events = registry.subscribe().await;
        let (existing, seeded_through) = registry.snapshot().await;
        let integrator = Self {
            table,
            config,
            collector,
            state: Mutex::new(SyncState::default()),
            events: Mutex::new(Some(events)),
            seeded_through,
        };

        if !existing.is_empty() {
            info!("Seeding routes from {} registered instances", existing.len());
            let mut state = integrator.state.lock().await;
            let mut names = BTreeSet::new();
            for instance in existing {
                integrator.observe_instance(&mut state, &instance);
                names.insert(instance.name.clone());
                state.service_map.insert(instance.id.clone(), instance);
            }
            for name in names {
                integrator.ensure_default_route(&mut state, &name);
                integrator.sync_service(&mut state, &name).await;
            }
        }

        integrator
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Apply one registry event
    pub async fn handle_event(&self, event: ServiceEvent) {
        let mut state = self.state.lock().await;
        state.stats.events_processed += 1;
        if let Some(collector) = &self.collector {
            collector
                .registry_events_total
                .with_label_values(&[event.kind.as_str()])
                .inc();
        }

        let instance = event.instance;
        debug!(
            service_id = %instance.id,
            service = %instance.name,
            status = %instance.status,
            sequence = event.sequence,
            "Handling {} event",
            event.kind
        );

        self.observe_instance(&mut state, &instance);
        let name = instance.name.clone();

        let removed = event.kind.is_removal();
        if let Some(data) = state.metrics.get_mut(&instance.id) {
            data.set_removed(removed, Instant::now());
        }
        if removed {
            state.service_map.remove(&instance.id);
        } else {
            state.service_map.insert(instance.id.clone(), instance);
            self.ensure_default_route(&mut state, &name);
        }

        self.sync_service(&mut state, &name).await;
    }

    /// Bind an extra path to a service and push its current Up set
    pub async fn add_service_route(&self, service_name: &str, path: &str) {
        let mut state = self.state.lock().await;
        let inserted = state
            .route_map
            .entry(service_name.to_string())
            .or_default()
            .insert(path.to_string());
        if inserted {
            info!("Bound path {} to service {}", path, service_name);
        }
        self.sync_service(&mut state, service_name).await;
    }

    /// Unbind a path from a service and drop its route.
    ///
    /// A service whose bindings are all removed stays unrouted until a path
    /// is bound again.
    pub async fn remove_service_route(&self, service_name: &str, path: &str) -> bool {
        let mut state = self.state.lock().await;
        let unbound = state
            .route_map
            .get_mut(service_name)
            .map(|paths| paths.remove(path))
            .unwrap_or(false);
        if !unbound {
            return false;
        }

        if self.table.remove_route(path).await {
            state.stats.route_removals += 1;
            if let Some(collector) = &self.collector {
                collector.route_removals_total.inc();
            }
        }
        self.update_route_gauge().await;
        info!("Unbound path {} from service {}", path, service_name);
        true
    }

    /// Paths currently bound to a service
    pub async fn service_routes(&self, service_name: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .route_map
            .get(service_name)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of all per-instance metrics, ordered by instance id
    pub async fn service_metrics(&self) -> Vec<ServiceMetricData> {
        let state = self.state.lock().await;
        let mut metrics: Vec<ServiceMetricData> = state.metrics.values().cloned().collect();
        metrics.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        metrics
    }

    pub async fn instance_metrics(&self, instance_id: &str) -> Option<ServiceMetricData> {
        self.state.lock().await.metrics.get(instance_id).cloned()
    }

    /// Count a dispatched request against the instance that served it
    pub async fn record_request(&self, instance_id: &str, success: bool, error: Option<&str>) {
        let mut state = self.state.lock().await;
        match state.metrics.get_mut(instance_id) {
            Some(data) => data.record_request(success, error),
            None => debug!(service_id = %instance_id, "Request recorded for unknown instance"),
        }
    }

    pub async fn stats(&self) -> SyncStats {
        self.state.lock().await.stats.clone()
    }

    /// Accrue availability for every live instance and evict metrics of
    /// instances removed longer than the retention period ago
    pub async fn refresh_metrics(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let live: Vec<String> = state.service_map.keys().cloned().collect();
        for id in live {
            if let Some(data) = state.metrics.get_mut(&id) {
                data.accrue(now);
            }
        }

        let retention = self.config.metrics_retention;
        let before = state.metrics.len();
        state
            .metrics
            .retain(|_, data| !data.retention_elapsed(now, retention));
        let evicted = before - state.metrics.len();
        if evicted > 0 {
            debug!("Evicted metrics of {} removed instances", evicted);
        }
    }

    /// Handle every event already buffered on the subscription.
    ///
    /// Only meaningful before `start`, which takes ownership of the stream.
    pub async fn process_pending(&self) -> usize {
        let mut processed = 0;
        loop {
            let next = {
                let mut events = self.events.lock().await;
                events.as_mut().and_then(|stream| stream.try_recv())
            };
            match next {
                Some(event) => {
                    if self.consume(event).await {
                        processed += 1;
                    }
                }
                None => return processed,
            }
        }
    }

    /// Spawn the event loop and metrics ticker.
    ///
    /// On cancellation, events already buffered are applied before the loop
    /// exits. The loop also ends when the registry closes the stream.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(mut events) = this.events.lock().await.take() else {
                warn!("Integrator already started");
                return;
            };

            let period = this.config.metrics_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Discovery sync started (metrics every {:?})", period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let mut drained = 0;
                        while let Some(event) = events.try_recv() {
                            if this.consume(event).await {
                                drained += 1;
                            }
                        }
                        info!("Discovery sync stopping after draining {} events", drained);
                        break;
                    }
                    event = events.recv() => match event {
                        Some(event) => {
                            this.consume(event).await;
                        }
                        None => {
                            info!("Registry event stream closed");
                            break;
                        }
                    },
                    _ = ticker.tick() => this.refresh_metrics().await,
                }
            }

            if events.dropped_events() > 0 {
                warn!(
                    "Discovery sync missed {} events to a full buffer",
                    events.dropped_events()
                );
            }
        })
    }

    /// Apply a streamed event unless the seed snapshot already reflects it
    async fn consume(&self, event: ServiceEvent) -> bool {
        if event.sequence <= self.seeded_through {
            debug!(
                sequence = event.sequence,
                "Skipping event older than the seed snapshot"
            );
            return false;
        }
        self.handle_event(event).await;
        true
    }

    /// Accrue time under the previous status, then record the new one
    fn observe_instance(&self, state: &mut SyncState, instance: &ServiceInstance) {
        let data = state
            .metrics
            .entry(instance.id.clone())
            .or_insert_with(|| ServiceMetricData::new(&instance.id, &instance.name));
        data.accrue(Instant::now());
        data.observe_status(instance.status, Utc::now());
    }

    fn ensure_default_route(&self, state: &mut SyncState, name: &str) {
        if !state.route_map.contains_key(name) {
            let path = format!("/{}/*", name);
            debug!("Binding default path {} to service {}", path, name);
            state
                .route_map
                .insert(name.to_string(), BTreeSet::from([path]));
        }
    }

    /// Push the current Up set of `name` to every path bound to it
    async fn sync_service(&self, state: &mut SyncState, name: &str) {
        let paths: Vec<String> = match state.route_map.get(name) {
            Some(paths) => paths.iter().cloned().collect(),
            None => return,
        };

        let mut up: Vec<&ServiceInstance> = state
            .service_map
            .values()
            .filter(|i| i.name == name && i.is_up())
            .collect();
        up.sort_by(|a, b| a.id.cmp(&b.id));

        let mut targets = Vec::with_capacity(up.len());
        let mut rejected = Vec::new();
        for instance in up {
            let url = instance.target_url();
            match Target::parse(&url, instance.weight, Some(instance.id.clone())) {
                Ok(target) => targets.push(target),
                Err(e) => {
                    warn!(service_id = %instance.id, "Skipping target: {}", e);
                    rejected.push((instance.id.clone(), e.to_string()));
                }
            }
        }

        for (id, error) in rejected {
            state.stats.route_errors += 1;
            if let Some(collector) = &self.collector {
                collector.route_errors_total.inc();
            }
            if let Some(data) = state.metrics.get_mut(&id) {
                data.record_error(&error);
            }
        }

        for path in paths {
            if targets.is_empty() {
                if self.table.remove_route(&path).await {
                    state.stats.route_removals += 1;
                    if let Some(collector) = &self.collector {
                        collector.route_removals_total.inc();
                    }
                }
                continue;
            }

            match self
                .table
                .update_route(&path, targets.clone(), self.config.load_balancing_enabled)
                .await
            {
                Ok(()) => {
                    state.stats.route_updates += 1;
                    if let Some(collector) = &self.collector {
                        collector.route_updates_total.inc();
                    }
                }
                Err(e) => {
                    warn!("Failed to update route {}: {}", path, e);
                    state.stats.route_errors += 1;
                    if let Some(collector) = &self.collector {
                        collector.route_errors_total.inc();
                    }
                }
            }
        }

        self.update_route_gauge().await;
    }

    async fn update_route_gauge(&self) {
        if let Some(collector) = &self.collector {
            collector.routes.set(self.table.len().await as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{EventKind, RegistrationOptions, RegistryConfig, ServiceStatus};

    fn instance(id: &str, address: &str, status: ServiceStatus) -> ServiceInstance {
        let mut instance = ServiceInstance::new(id, "svc", address, 8080);
        instance.status = status;
        instance
    }

    fn event(kind: EventKind, instance: ServiceInstance) -> ServiceEvent {
        ServiceEvent {
            kind,
            instance,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    async fn integrator() -> (ServiceRegistry, Arc<RoutingTable>, ProxyDiscoveryIntegrator) {
        let registry = ServiceRegistry::new(RegistryConfig::default());
        let table = Arc::new(RoutingTable::default());
        let integrator = ProxyDiscoveryIntegrator::new(
            &registry,
            table.clone(),
            SyncConfig::default(),
            Some(MetricsCollector::new().unwrap()),
        )
        .await;
        (registry, table, integrator)
    }

    async fn target_urls(table: &RoutingTable, path: &str) -> Option<Vec<String>> {
        table
            .route(path)
            .await
            .map(|r| r.targets.into_iter().map(|t| t.url).collect())
    }

    #[tokio::test]
    async fn test_scenario_register_then_expire() {
        let (_registry, table, integrator) = integrator().await;
        let a = instance("a", "10.0.0.1", ServiceStatus::Up);
        let b = instance("b", "10.0.0.2", ServiceStatus::Up);

        integrator.handle_event(event(EventKind::Register, a.clone())).await;
        assert_eq!(
            target_urls(&table, "/svc/*").await,
            Some(vec!["http://10.0.0.1:8080".to_string()])
        );

        integrator.handle_event(event(EventKind::Register, b.clone())).await;
        assert_eq!(
            target_urls(&table, "/svc/*").await,
            Some(vec![
                "http://10.0.0.1:8080".to_string(),
                "http://10.0.0.2:8080".to_string()
            ])
        );

        integrator.handle_event(event(EventKind::Expire, a)).await;
        assert_eq!(
            target_urls(&table, "/svc/*").await,
            Some(vec!["http://10.0.0.2:8080".to_string()])
        );

        integrator.handle_event(event(EventKind::Expire, b)).await;
        assert_eq!(target_urls(&table, "/svc/*").await, None);

        let stats = integrator.stats().await;
        assert_eq!(stats.events_processed, 4);
        assert_eq!(stats.route_updates, 3);
        assert_eq!(stats.route_removals, 1);
    }

    #[tokio::test]
    async fn test_no_route_without_up_instances() {
        let (_registry, table, integrator) = integrator().await;

        integrator
            .handle_event(event(
                EventKind::Register,
                instance("a", "10.0.0.1", ServiceStatus::Starting),
            ))
            .await;
        assert!(table.is_empty().await);
        assert_eq!(integrator.service_routes("svc").await, vec!["/svc/*"]);

        integrator
            .handle_event(event(EventKind::Update, instance("a", "10.0.0.1", ServiceStatus::Up)))
            .await;
        assert_eq!(table.len().await, 1);

        integrator
            .handle_event(event(EventKind::Update, instance("a", "10.0.0.1", ServiceStatus::Down)))
            .await;
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_target_is_skipped() {
        let (_registry, table, integrator) = integrator().await;

        integrator
            .handle_event(event(EventKind::Register, instance("a", "10.0.0.1", ServiceStatus::Up)))
            .await;
        integrator
            .handle_event(event(EventKind::Register, instance("bad", "bad host", ServiceStatus::Up)))
            .await;

        assert_eq!(
            target_urls(&table, "/svc/*").await,
            Some(vec!["http://10.0.0.1:8080".to_string()])
        );
        assert_eq!(integrator.stats().await.route_errors, 1);
        let bad = integrator.instance_metrics("bad").await.unwrap();
        assert!(bad.last_error.is_some());
    }

    #[tokio::test]
    async fn test_only_malformed_targets_removes_route() {
        let (_registry, table, integrator) = integrator().await;
        integrator
            .handle_event(event(EventKind::Register, instance("a", "10.0.0.1", ServiceStatus::Up)))
            .await;
        integrator
            .handle_event(event(EventKind::Update, instance("a", "bad host", ServiceStatus::Up)))
            .await;

        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_service_route_pushes_current_set() {
        let (_registry, table, integrator) = integrator().await;
        integrator
            .handle_event(event(EventKind::Register, instance("a", "10.0.0.1", ServiceStatus::Up)))
            .await;

        integrator.add_service_route("svc", "/api/svc/").await;
        assert_eq!(
            target_urls(&table, "/api/svc/").await,
            Some(vec!["http://10.0.0.1:8080".to_string()])
        );
        assert_eq!(
            integrator.service_routes("svc").await,
            vec!["/api/svc/", "/svc/*"]
        );

        assert!(integrator.remove_service_route("svc", "/api/svc/").await);
        assert!(!integrator.remove_service_route("svc", "/api/svc/").await);
        assert_eq!(table.route("/api/svc/").await, None);
        assert!(table.route("/svc/*").await.is_some());
    }

    #[tokio::test]
    async fn test_explicit_binding_replaces_default() {
        let (_registry, table, integrator) = integrator().await;
        integrator.add_service_route("svc", "/orders/*").await;
        assert!(table.is_empty().await);

        integrator
            .handle_event(event(EventKind::Register, instance("a", "10.0.0.1", ServiceStatus::Up)))
            .await;
        assert!(table.route("/orders/*").await.is_some());
        assert!(table.route("/svc/*").await.is_none());
    }

    #[tokio::test]
    async fn test_status_history_recorded_once_per_change() {
        let (_registry, _table, integrator) = integrator().await;
        for status in [
            ServiceStatus::Starting,
            ServiceStatus::Up,
            ServiceStatus::Up,
            ServiceStatus::Down,
        ] {
            integrator
                .handle_event(event(EventKind::Update, instance("a", "10.0.0.1", status)))
                .await;
        }
        integrator
            .handle_event(event(
                EventKind::Deregister,
                instance("a", "10.0.0.1", ServiceStatus::Deregistered),
            ))
            .await;

        let data = integrator.instance_metrics("a").await.unwrap();
        let statuses: Vec<ServiceStatus> =
            data.status_history.iter().map(|c| c.new_status).collect();
        assert_eq!(
            statuses,
            vec![
                ServiceStatus::Starting,
                ServiceStatus::Up,
                ServiceStatus::Down,
                ServiceStatus::Deregistered
            ]
        );
        assert_eq!(data.status_history[0].old_status, None);
        for pair in data.status_history.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
            assert_ne!(pair[0].new_status, pair[1].new_status);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accrual_covers_elapsed_time() {
        let (_registry, _table, integrator) = integrator().await;
        integrator
            .handle_event(event(EventKind::Register, instance("a", "10.0.0.1", ServiceStatus::Up)))
            .await;

        tokio::time::advance(Duration::from_secs(30)).await;
        integrator.refresh_metrics().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        integrator
            .handle_event(event(EventKind::Update, instance("a", "10.0.0.1", ServiceStatus::Down)))
            .await;
        tokio::time::advance(Duration::from_secs(20)).await;
        integrator.refresh_metrics().await;

        let data = integrator.instance_metrics("a").await.unwrap();
        assert_eq!(data.available_time, Duration::from_secs(40));
        assert_eq!(data.down_time, Duration::from_secs(20));
        assert_eq!(data.available_time + data.down_time, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_record_request() {
        let (_registry, _table, integrator) = integrator().await;
        integrator
            .handle_event(event(EventKind::Register, instance("a", "10.0.0.1", ServiceStatus::Up)))
            .await;

        integrator.record_request("a", true, None).await;
        integrator.record_request("a", false, Some("connection refused")).await;
        integrator.record_request("unknown", true, None).await;

        let data = integrator.instance_metrics("a").await.unwrap();
        assert_eq!(data.request_count, 2);
        assert_eq!(data.error_count, 1);
        assert_eq!(data.last_error.as_deref(), Some("connection refused"));
        assert!(integrator.instance_metrics("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_converges_from_registry_events() {
        let (registry, table, integrator) = integrator().await;
        registry
            .register(
                ServiceInstance::new("a", "svc", "10.0.0.1", 8080),
                RegistrationOptions::default().with_initial_status(ServiceStatus::Up),
            )
            .await
            .unwrap();
        registry
            .register(
                ServiceInstance::new("b", "svc", "10.0.0.2", 8080),
                RegistrationOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(integrator.process_pending().await, 2);
        assert_eq!(
            target_urls(&table, "/svc/*").await,
            Some(vec!["http://10.0.0.1:8080".to_string()])
        );

        registry.update_status("b", ServiceStatus::Up).await.unwrap();
        registry.update_status("a", ServiceStatus::Down).await.unwrap();
        integrator.process_pending().await;
        assert_eq!(
            target_urls(&table, "/svc/*").await,
            Some(vec!["http://10.0.0.2:8080".to_string()])
        );

        registry.deregister("b").await.unwrap();
        integrator.process_pending().await;
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_seeds_routes_from_existing_instances() {
        let registry = ServiceRegistry::new(RegistryConfig::default());
        registry
            .register(
                ServiceInstance::new("a", "svc", "10.0.0.1", 8080),
                RegistrationOptions::default().with_initial_status(ServiceStatus::Up),
            )
            .await
            .unwrap();

        let table = Arc::new(RoutingTable::default());
        let integrator =
            ProxyDiscoveryIntegrator::new(&registry, table.clone(), SyncConfig::default(), None)
                .await;

        assert_eq!(table.len().await, 1);
        assert_eq!(integrator.process_pending().await, 0);
    }

    #[tokio::test]
    async fn test_start_drains_on_cancel() {
        let (registry, table, integrator) = integrator().await;
        let integrator = Arc::new(integrator);

        registry
            .register(
                ServiceInstance::new("a", "svc", "10.0.0.1", 8080),
                RegistrationOptions::default().with_initial_status(ServiceStatus::Up),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        integrator.start(cancel).await.unwrap();

        assert_eq!(table.len().await, 1);
        assert_eq!(integrator.stats().await.events_processed, 1);
    }

    #[tokio::test]
    async fn test_start_stops_when_registry_shuts_down() {
        let (registry, table, integrator) = integrator().await;
        let integrator = Arc::new(integrator);
        let handle = integrator.start(CancellationToken::new());

        registry
            .register(
                ServiceInstance::new("a", "svc", "10.0.0.1", 8080),
                RegistrationOptions::default()
                    .with_initial_status(ServiceStatus::Up)
                    .locally_owned(),
            )
            .await
            .unwrap();
        registry.shutdown().await;

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        // Register then the shutdown deregistration
        assert_eq!(integrator.stats().await.events_processed, 2);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_ipv6_instance_is_routed() {
        let (_registry, table, integrator) = integrator().await;
        integrator
            .handle_event(event(EventKind::Register, instance("v6", "fd00::1", ServiceStatus::Up)))
            .await;

        assert_eq!(
            target_urls(&table, "/svc/*").await,
            Some(vec!["http://[fd00::1]:8080".to_string()])
        );
        assert_eq!(integrator.stats().await.route_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_instance_metrics_are_evicted_after_retention() {
        let (_registry, _table, integrator) = integrator().await;
        let retention = integrator.config().metrics_retention;

        integrator
            .handle_event(event(EventKind::Register, instance("a", "10.0.0.1", ServiceStatus::Up)))
            .await;
        integrator
            .handle_event(event(EventKind::Register, instance("b", "10.0.0.2", ServiceStatus::Up)))
            .await;
        integrator
            .handle_event(event(
                EventKind::Expire,
                instance("a", "10.0.0.1", ServiceStatus::Deregistered),
            ))
            .await;

        tokio::time::advance(retention - Duration::from_secs(1)).await;
        integrator.refresh_metrics().await;
        assert!(integrator.instance_metrics("a").await.is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        integrator.refresh_metrics().await;
        assert!(integrator.instance_metrics("a").await.is_none());
        // Live instances are never evicted
        assert!(integrator.instance_metrics("b").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_cancels_eviction() {
        let (_registry, _table, integrator) = integrator().await;
        let retention = integrator.config().metrics_retention;

        integrator
            .handle_event(event(
                EventKind::Deregister,
                instance("a", "10.0.0.1", ServiceStatus::Deregistered),
            ))
            .await;
        integrator
            .handle_event(event(EventKind::Register, instance("a", "10.0.0.1", ServiceStatus::Up)))
            .await;

        tokio::time::advance(retention * 2).await;
        integrator.refresh_metrics().await;
        assert!(integrator.instance_metrics("a").await.is_some());
    }

    #[tokio::test]
    async fn test_events_covered_by_seed_snapshot_are_skipped() {
        let registry = ServiceRegistry::new(RegistryConfig::default());
        registry
            .register(
                ServiceInstance::new("a", "svc", "10.0.0.1", 8080),
                RegistrationOptions::default().with_initial_status(ServiceStatus::Down),
            )
            .await
            .unwrap();
        registry.update_status("a", ServiceStatus::Up).await.unwrap();

        let table = Arc::new(RoutingTable::default());
        let integrator =
            ProxyDiscoveryIntegrator::new(&registry, table.clone(), SyncConfig::default(), None)
                .await;

        // A replay of the earlier Down must not rewrite history or routes
        let mut stale = event(EventKind::Update, instance("a", "10.0.0.1", ServiceStatus::Down));
        stale.sequence = 1;
        assert!(!integrator.consume(stale).await);

        let data = integrator.instance_metrics("a").await.unwrap();
        assert_eq!(data.status_history.len(), 1);
        assert_eq!(data.status, ServiceStatus::Up);
        assert_eq!(table.len().await, 1);

        registry.update_status("a", ServiceStatus::Down).await.unwrap();
        assert_eq!(integrator.process_pending().await, 1);
        assert!(table.is_empty().await);
    }
}
