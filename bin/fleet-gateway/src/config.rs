//! Gateway configuration: YAML file plus environment overrides

use anyhow::{Context, Result};
use fleet_core::{HealthCheckConfig, RegistrationOptions, RegistryConfig, ServiceInstance, ServiceStatus};
use fleet_proxy::LoadBalancingStrategy;
use fleet_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Which built-in prober the health checker uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProberKind {
    Tcp,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub sweep_interval_secs: u64,
    pub subscriber_buffer: usize,
    pub down_grace_period_secs: u64,
    /// Registrations are restored from and saved to this file when set
    pub store_path: Option<PathBuf>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            subscriber_buffer: 100,
            down_grace_period_secs: 30,
            store_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    pub failure_threshold: u32,
    pub prober: ProberKind,
    /// Request path used by the HTTP prober
    pub http_path: String,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_ms: 5000,
            failure_threshold: 3,
            prober: ProberKind::Tcp,
            http_path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub metrics_interval_secs: u64,
    pub load_balancing: LoadBalancingStrategy,
    pub load_balancing_enabled: bool,
    /// Metrics of a removed instance are dropped this long after removal
    pub metrics_retention_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 30,
            load_balancing: LoadBalancingStrategy::RoundRobin,
            load_balancing_enabled: true,
            metrics_retention_secs: 3600,
        }
    }
}

/// Explicit path bound to a service instead of its `/{name}/*` default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteBinding {
    pub service: String,
    pub path: String,
}

/// Instance registered by the gateway itself at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedService {
    /// Generated when omitted
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub address: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub port: u16,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_true")]
    pub auto_renew: bool,
    #[serde(default)]
    pub health_check_interval_secs: Option<u64>,
    #[serde(default)]
    pub initial_status: ServiceStatus,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl SeedService {
    /// Build the instance and options to register. Seeds are locally owned.
    pub fn to_registration(&self) -> (ServiceInstance, RegistrationOptions) {
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.name, uuid::Uuid::new_v4()));

        let mut instance = ServiceInstance::new(id, &self.name, &self.address, self.port)
            .with_version(&self.version)
            .with_protocol(&self.protocol)
            .with_weight(self.weight);
        instance.tags = self.tags.clone();
        for (key, value) in &self.metadata {
            instance = instance.with_metadata(key, value);
        }

        let mut options = RegistrationOptions::default()
            .with_ttl(Duration::from_secs(self.ttl_secs))
            .with_auto_renew(self.auto_renew)
            .with_initial_status(self.initial_status)
            .locally_owned();
        if let Some(secs) = self.health_check_interval_secs {
            options = options.with_health_check_interval(Duration::from_secs(secs));
        }
        if let Some(threshold) = self.failure_threshold {
            options = options.with_failure_threshold(threshold);
        }

        (instance, options)
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
    pub registry: RegistrySection,
    pub health: HealthSection,
    pub sync: SyncSection,
    pub forward_timeout_ms: u64,
    pub routes: Vec<RouteBinding>,
    pub services: Vec<SeedService>,
    /// Abort startup when a seed service cannot be registered
    pub fail_on_registration_error: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            registry: RegistrySection::default(),
            health: HealthSection::default(),
            sync: SyncSection::default(),
            forward_timeout_ms: 30_000,
            routes: Vec::new(),
            services: Vec::new(),
            fail_on_registration_error: false,
        }
    }
}

impl GatewayConfig {
    /// Load from the file named by `FLEET_CONFIG` (defaults when unset),
    /// then apply `FLEET_*` environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("FLEET_CONFIG") {
            Ok(path) => {
                let data = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path))?;
                Self::from_yaml(&data).with_context(|| format!("Invalid config file {}", path))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = lookup("FLEET_LISTEN_ADDR") {
            self.listen_addr = addr
                .parse()
                .with_context(|| format!("Invalid FLEET_LISTEN_ADDR: {}", addr))?;
        }
        if let Some(level) = lookup("FLEET_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(format) = lookup("FLEET_LOG_FORMAT") {
            self.log_format = match format.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => anyhow::bail!("Invalid FLEET_LOG_FORMAT: {}", other),
            };
        }
        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            sweep_interval: Duration::from_secs(self.registry.sweep_interval_secs.max(1)),
            subscriber_buffer: self.registry.subscriber_buffer.max(1),
            down_grace_period: Duration::from_secs(self.registry.down_grace_period_secs),
        }
    }

    pub fn health_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_secs(self.health.interval_secs.max(1)),
            timeout: Duration::from_millis(self.health.timeout_ms),
            failure_threshold: self.health.failure_threshold.max(1),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            metrics_interval: Duration::from_secs(self.sync.metrics_interval_secs.max(1)),
            load_balancing_enabled: self.sync.load_balancing_enabled,
            metrics_retention: Duration::from_secs(self.sync.metrics_retention_secs),
        }
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}
