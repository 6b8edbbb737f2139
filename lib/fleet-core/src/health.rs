//! Active health checking that drives registry status

use crate::instance::{parse_endpoint, DEFAULT_FAILURE_THRESHOLD};
use crate::{CoreError, Result, ServiceRegistry, ServiceStatus};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Clone, Debug)]
pub struct HealthCheckConfig {
    /// Interval between probes of one instance, unless its registration overrides it
    pub interval: Duration,
    /// Deadline for a single probe
    pub timeout: Duration,
    /// Consecutive failures before an instance is marked down
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Liveness probe against one instance.
///
/// `address` is the instance's target URL (`scheme://host:port`).
/// `Ok(false)` and `Err(_)` both count as a failed probe.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str) -> Result<bool>;
}

/// Considers an instance healthy if a TCP connection can be opened
pub struct TcpProber;

#[async_trait::async_trait]
impl Prober for TcpProber {
    async fn probe(&self, address: &str) -> Result<bool> {
        let (_, host, port) = parse_endpoint(address)?;
        match tokio::net::TcpStream::connect((host.as_str(), port)).await {
            Ok(_) => {
                debug!("TCP connection to {} succeeded", address);
                Ok(true)
            }
            Err(e) => Err(CoreError::ProbeFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Issues `GET {address}{path}` and treats any 2xx as healthy
pub struct HttpProber {
    client: reqwest::Client,
    path: String,
}

impl HttpProber {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            path: path.into(),
        }
    }

    fn url(&self, address: &str) -> String {
        format!("{}{}", address.trim_end_matches('/'), self.path)
    }
}

#[async_trait::async_trait]
impl Prober for HttpProber {
    async fn probe(&self, address: &str) -> Result<bool> {
        let url = self.url(address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::ProbeFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let healthy = response.status().is_success();
        if !healthy {
            debug!("{} answered health check with {}", url, response.status());
        }
        Ok(healthy)
    }
}

/// Result of a single probe round for one instance
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeOutcome {
    Passed { recovered: bool },
    Failed { consecutive_failures: u32, marked_down: bool },
    /// A probe for this instance was already running
    Skipped,
}

/// Counters exposed for observability
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HealthStats {
    pub probes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub transitions: u64,
}

#[derive(Default)]
struct HealthCounters {
    probes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    transitions: AtomicU64,
}

struct ProbeState {
    consecutive_failures: u32,
    in_flight: bool,
    next_due: Instant,
}

/// Health checker for monitoring registered instances
pub struct HealthChecker {
    registry: ServiceRegistry,
    prober: Arc<dyn Prober>,
    config: HealthCheckConfig,
    states: Mutex<HashMap<String, ProbeState>>,
    counters: HealthCounters,
}

impl HealthChecker {
    pub fn new(
        registry: ServiceRegistry,
        prober: Arc<dyn Prober>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            registry,
            prober,
            config,
            states: Mutex::new(HashMap::new()),
            counters: HealthCounters::default(),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    pub fn stats(&self) -> HealthStats {
        HealthStats {
            probes: self.counters.probes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            transitions: self.counters.transitions.load(Ordering::Relaxed),
        }
    }

    /// Current run of failed probes for an instance
    pub async fn consecutive_failures(&self, id: &str) -> u32 {
        self.states
            .lock()
            .await
            .get(id)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Probe one instance and apply the result to the registry.
    ///
    /// Never runs two probes for the same instance at once.
    pub async fn check_instance(&self, id: &str) -> Result<ProbeOutcome> {
        let (instance, options) = self.registry.registration(id).await?;
        let interval = options.health_check_interval.unwrap_or(self.config.interval);
        let threshold = options
            .failure_threshold
            .unwrap_or(self.config.failure_threshold)
            .max(1);

        {
            let mut states = self.states.lock().await;
            let state = states.entry(id.to_string()).or_insert_with(|| ProbeState {
                consecutive_failures: 0,
                in_flight: false,
                next_due: Instant::now(),
            });
            if state.in_flight {
                return Ok(ProbeOutcome::Skipped);
            }
            state.in_flight = true;
        }

        let address = instance.target_url();
        self.counters.probes.fetch_add(1, Ordering::Relaxed);
        let healthy = match time::timeout(self.config.timeout, self.prober.probe(&address)).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(e)) => {
                warn!(service_id = %id, "Health check error: {}", e);
                false
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let e = CoreError::ProbeTimeout {
                    address: address.clone(),
                    timeout: self.config.timeout,
                };
                warn!(service_id = %id, "{}", e);
                false
            }
        };

        let failures = {
            let mut states = self.states.lock().await;
            match states.get_mut(id) {
                Some(state) => {
                    state.in_flight = false;
                    state.next_due = Instant::now() + interval;
                    if healthy {
                        state.consecutive_failures = 0;
                    } else {
                        state.consecutive_failures += 1;
                    }
                    state.consecutive_failures
                }
                None => u32::from(!healthy),
            }
        };

        // Status may have moved while the probe was running
        let current = match self.registry.get(id).await {
            Ok(current) => current.status,
            Err(_) => {
                debug!(service_id = %id, "Instance left the registry during probe");
                return Ok(if healthy {
                    ProbeOutcome::Passed { recovered: false }
                } else {
                    ProbeOutcome::Failed {
                        consecutive_failures: failures,
                        marked_down: false,
                    }
                });
            }
        };

        if healthy {
            let recovered = current != ServiceStatus::Up
                && self.transition(id, ServiceStatus::Up).await;
            if recovered {
                info!(service_id = %id, "Instance passed health check, marked up");
            }
            return Ok(ProbeOutcome::Passed { recovered });
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        debug!(
            service_id = %id,
            "Health check failed ({}/{} consecutive)",
            failures,
            threshold
        );
        let marked_down = failures >= threshold
            && current != ServiceStatus::Down
            && self.transition(id, ServiceStatus::Down).await;
        if marked_down {
            warn!(
                service_id = %id,
                "Instance failed {} consecutive health checks, marked down",
                failures
            );
        }
        Ok(ProbeOutcome::Failed {
            consecutive_failures: failures,
            marked_down,
        })
    }

    /// Probe every due instance each tick until cancelled
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let checker = Arc::clone(self);
        let tick = checker.config.interval.min(Duration::from_secs(1));

        tokio::spawn(async move {
            info!(
                "Health checker started (interval {:?}, timeout {:?})",
                checker.config.interval, checker.config.timeout
            );
            let mut probes = JoinSet::new();
            let mut ticker = time::interval(tick);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for id in checker.due_instances().await {
                            let checker = Arc::clone(&checker);
                            probes.spawn(async move {
                                if let Err(e) = checker.check_instance(&id).await {
                                    debug!(service_id = %id, "Probe skipped: {}", e);
                                }
                            });
                        }
                        while probes.try_join_next().is_some() {}
                    }
                }
            }
            probes.abort_all();
            debug!("Health checker stopped");
        })
    }

    /// Ids whose next probe is due and which have no probe running.
    /// Also forgets instances that have left the registry.
    async fn due_instances(&self) -> Vec<String> {
        let registrations = self.registry.registrations().await;
        let now = Instant::now();
        let mut states = self.states.lock().await;

        states.retain(|id, _| registrations.iter().any(|(i, _)| &i.id == id));

        let mut due = Vec::new();
        for (instance, options) in registrations {
            let interval = options.health_check_interval.unwrap_or(self.config.interval);
            let state = states.entry(instance.id.clone()).or_insert_with(|| {
                // Spread first probes across one interval
                let jitter = rand::thread_rng().gen_range(0..=interval.as_millis() as u64);
                ProbeState {
                    consecutive_failures: 0,
                    in_flight: false,
                    next_due: now + Duration::from_millis(jitter),
                }
            });
            if !state.in_flight && state.next_due <= now {
                due.push(instance.id);
            }
        }
        due
    }

    async fn transition(&self, id: &str, status: ServiceStatus) -> bool {
        match self.registry.update_status(id, status).await {
            Ok(()) => {
                self.counters.transitions.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!(service_id = %id, "Could not apply health transition: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventStream, RegistrationOptions, ServiceInstance};
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    /// Replays a fixed list of probe results, then reports healthy
    struct ScriptedProber {
        results: std::sync::Mutex<VecDeque<bool>>,
    }

    impl ScriptedProber {
        fn new(results: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                results: std::sync::Mutex::new(results.iter().copied().collect()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _address: &str) -> Result<bool> {
            Ok(self.results.lock().unwrap().pop_front().unwrap_or(true))
        }
    }

    struct HangingProber;

    #[async_trait::async_trait]
    impl Prober for HangingProber {
        async fn probe(&self, _address: &str) -> Result<bool> {
            time::sleep(Duration::from_secs(3600)).await;
            Ok(true)
        }
    }

    struct GatedProber {
        gate: Notify,
    }

    #[async_trait::async_trait]
    impl Prober for GatedProber {
        async fn probe(&self, _address: &str) -> Result<bool> {
            self.gate.notified().await;
            Ok(true)
        }
    }

    struct AlwaysDown;

    #[async_trait::async_trait]
    impl Prober for AlwaysDown {
        async fn probe(&self, address: &str) -> Result<bool> {
            Err(CoreError::ProbeFailed {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }

    async fn setup(prober: Arc<dyn Prober>) -> (Arc<HealthChecker>, ServiceRegistry, EventStream) {
        let registry = ServiceRegistry::default();
        registry
            .register(
                ServiceInstance::new("a", "svc", "10.0.0.1", 8080),
                RegistrationOptions::default()
                    .with_initial_status(ServiceStatus::Up)
                    .with_auto_renew(true),
            )
            .await
            .unwrap();
        let stream = registry.subscribe().await;
        let checker = Arc::new(HealthChecker::new(
            registry.clone(),
            prober,
            HealthCheckConfig::default(),
        ));
        (checker, registry, stream)
    }

    #[test]
    fn test_default_config() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.failure_threshold, 3);
    }

    #[test]
    fn test_http_prober_url() {
        let prober = HttpProber::new("/health");
        assert_eq!(prober.url("http://10.0.0.1:8080"), "http://10.0.0.1:8080/health");
        assert_eq!(prober.url("http://10.0.0.1:8080/"), "http://10.0.0.1:8080/health");
    }

    #[tokio::test]
    async fn test_two_failures_then_success_keeps_instance_up() {
        let (checker, registry, mut stream) = setup(ScriptedProber::new(&[false, false, true])).await;

        assert_eq!(
            checker.check_instance("a").await.unwrap(),
            ProbeOutcome::Failed { consecutive_failures: 1, marked_down: false }
        );
        assert_eq!(
            checker.check_instance("a").await.unwrap(),
            ProbeOutcome::Failed { consecutive_failures: 2, marked_down: false }
        );
        assert_eq!(
            checker.check_instance("a").await.unwrap(),
            ProbeOutcome::Passed { recovered: false }
        );

        assert_eq!(registry.get("a").await.unwrap().status, ServiceStatus::Up);
        assert_eq!(checker.consecutive_failures("a").await, 0);
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_threshold_failures_mark_down_and_success_recovers() {
        let (checker, registry, mut stream) = setup(ScriptedProber::new(&[false, false, false, false])).await;

        for _ in 0..2 {
            checker.check_instance("a").await.unwrap();
        }
        assert_eq!(
            checker.check_instance("a").await.unwrap(),
            ProbeOutcome::Failed { consecutive_failures: 3, marked_down: true }
        );
        assert_eq!(registry.get("a").await.unwrap().status, ServiceStatus::Down);

        let down = stream.try_recv().unwrap();
        assert_eq!(down.instance.status, ServiceStatus::Down);

        assert_eq!(
            checker.check_instance("a").await.unwrap(),
            ProbeOutcome::Failed { consecutive_failures: 4, marked_down: false }
        );
        assert!(stream.try_recv().is_none());

        assert_eq!(
            checker.check_instance("a").await.unwrap(),
            ProbeOutcome::Passed { recovered: true }
        );
        let up = stream.try_recv().unwrap();
        assert_eq!(up.instance.status, ServiceStatus::Up);
        assert!(stream.try_recv().is_none());
        assert_eq!(checker.stats().transitions, 2);
    }

    #[tokio::test]
    async fn test_probe_error_counts_as_failure() {
        let (checker, _registry, _stream) = setup(Arc::new(AlwaysDown)).await;
        let outcome = checker.check_instance("a").await.unwrap();
        assert_eq!(
            outcome,
            ProbeOutcome::Failed { consecutive_failures: 1, marked_down: false }
        );
        assert_eq!(checker.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_past_deadline_is_a_failure() {
        let (checker, _registry, _stream) = setup(Arc::new(HangingProber)).await;

        let outcome = checker.check_instance("a").await.unwrap();

        assert_eq!(
            outcome,
            ProbeOutcome::Failed { consecutive_failures: 1, marked_down: false }
        );
        assert_eq!(checker.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_probes_for_one_instance_are_single_flight() {
        let prober = Arc::new(GatedProber { gate: Notify::new() });
        let (checker, _registry, _stream) = setup(prober.clone()).await;

        let first = {
            let checker = checker.clone();
            tokio::spawn(async move { checker.check_instance("a").await })
        };
        while checker.stats().probes == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(checker.check_instance("a").await.unwrap(), ProbeOutcome::Skipped);

        prober.gate.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome, ProbeOutcome::Passed { recovered: false });
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let (checker, _registry, _stream) = setup(ScriptedProber::new(&[])).await;
        assert!(matches!(
            checker.check_instance("missing").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_per_registration_threshold_override() {
        let registry = ServiceRegistry::default();
        registry
            .register(
                ServiceInstance::new("a", "svc", "10.0.0.1", 8080),
                RegistrationOptions::default()
                    .with_initial_status(ServiceStatus::Up)
                    .with_failure_threshold(1),
            )
            .await
            .unwrap();
        let checker = HealthChecker::new(
            registry.clone(),
            ScriptedProber::new(&[false]),
            HealthCheckConfig::default(),
        );

        let outcome = checker.check_instance("a").await.unwrap();
        assert_eq!(
            outcome,
            ProbeOutcome::Failed { consecutive_failures: 1, marked_down: true }
        );
    }

    #[tokio::test]
    async fn test_starting_instance_comes_up_on_first_success() {
        let registry = ServiceRegistry::default();
        registry
            .register(
                ServiceInstance::new("a", "svc", "10.0.0.1", 8080),
                RegistrationOptions::default(),
            )
            .await
            .unwrap();
        let checker = HealthChecker::new(
            registry.clone(),
            ScriptedProber::new(&[true]),
            HealthCheckConfig::default(),
        );

        let outcome = checker.check_instance("a").await.unwrap();
        assert_eq!(outcome, ProbeOutcome::Passed { recovered: true });
        assert_eq!(registry.get("a").await.unwrap().status, ServiceStatus::Up);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_marks_failing_instance_down() {
        let registry = ServiceRegistry::default();
        registry
            .register(
                ServiceInstance::new("a", "svc", "10.0.0.1", 8080),
                RegistrationOptions::default()
                    .with_initial_status(ServiceStatus::Up)
                    .with_health_check_interval(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        let checker = Arc::new(HealthChecker::new(
            registry.clone(),
            Arc::new(AlwaysDown),
            HealthCheckConfig {
                interval: Duration::from_secs(1),
                ..Default::default()
            },
        ));
        let cancel = CancellationToken::new();
        let handle = checker.start(cancel.clone());

        time::sleep(Duration::from_secs(10)).await;

        assert_eq!(registry.get("a").await.unwrap().status, ServiceStatus::Down);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_check_reaches_ipv6_instance() {
        // Hosts without IPv6 loopback have nothing to check
        let Ok(listener) = tokio::net::TcpListener::bind("[::1]:0").await else {
            return;
        };
        let port = listener.local_addr().unwrap().port();

        let instance = ServiceInstance::new("v6", "svc", "::1", port);
        assert!(TcpProber.probe(&instance.target_url()).await.unwrap());
    }
}
