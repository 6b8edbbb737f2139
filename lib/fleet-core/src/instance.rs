//! Service instance model and registration options

use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

/// Default consecutive probe failures before an instance is marked down
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default registration time-to-live
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Operational status of a service instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Up,
    Down,
    Deregistered,
}

impl ServiceStatus {
    /// Whether a live instance may move from `self` to `next`.
    ///
    /// Nothing leaves `Deregistered`, and entering it is reserved for
    /// deregistration and expiry.
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        self != ServiceStatus::Deregistered && next != ServiceStatus::Deregistered
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Up => "up",
            ServiceStatus::Down => "down",
            ServiceStatus::Deregistered => "deregistered",
        }
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        ServiceStatus::Starting
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One running, independently addressable copy of a named service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Host name or IP, without scheme or port
    pub address: String,
    /// URL scheme used to reach the instance
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub port: u16,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Relative share of traffic under weighted load balancing
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "Utc::now")]
    pub last_renewal: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_weight() -> u32 {
    1
}

impl ServiceInstance {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: String::new(),
            address: address.into(),
            protocol: default_protocol(),
            port,
            status: ServiceStatus::Starting,
            tags: BTreeSet::new(),
            weight: default_weight(),
            last_renewal: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Build an instance from a single `scheme://host:port` endpoint string
    pub fn from_endpoint(
        id: impl Into<String>,
        name: impl Into<String>,
        endpoint: &str,
    ) -> Result<Self> {
        let (protocol, address, port) = parse_endpoint(endpoint)?;
        let mut instance = Self::new(id, name, address, port);
        instance.protocol = protocol;
        Ok(instance)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Upstream URL used as a proxy target and handed to probers.
    /// IPv6 hosts are bracketed.
    pub fn target_url(&self) -> String {
        if self.address.contains(':') {
            format!("{}://[{}]:{}", self.protocol, self.address, self.port)
        } else {
            format!("{}://{}:{}", self.protocol, self.address, self.port)
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == ServiceStatus::Up
    }

    /// Check whether this instance satisfies every criterion of a query
    pub fn matches(&self, query: &ServiceQuery) -> bool {
        if let Some(name) = &query.name {
            if &self.name != name {
                return false;
            }
        }
        if let Some(status) = query.status {
            if self.status != status {
                return false;
            }
        }
        query.tags.iter().all(|t| self.tags.contains(t))
    }
}

/// Split `scheme://host:port` into its parts. The scheme defaults to `http`
/// and brackets around an IPv6 host are removed.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, String, u16)> {
    let (protocol, rest) = match endpoint.find("://") {
        Some(pos) => (&endpoint[..pos], &endpoint[pos + 3..]),
        None => ("http", endpoint),
    };
    let rest = rest.trim_end_matches('/');

    let colon = rest
        .rfind(':')
        .ok_or_else(|| CoreError::InvalidInstance(format!("missing port in {}", endpoint)))?;
    let host = rest[..colon]
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(&rest[..colon]);
    let port = rest[colon + 1..]
        .parse::<u16>()
        .map_err(|_| CoreError::InvalidInstance(format!("invalid port in {}", endpoint)))?;

    if protocol.is_empty() || host.is_empty() {
        return Err(CoreError::InvalidInstance(format!(
            "malformed endpoint {}",
            endpoint
        )));
    }

    Ok((protocol.to_string(), host.to_string(), port))
}

/// Options attached to a registration at creation time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationOptions {
    pub ttl: Duration,
    pub auto_renew: bool,
    /// Overrides the health checker's global interval for this instance
    pub health_check_interval: Option<Duration>,
    pub initial_status: ServiceStatus,
    /// Overrides the health checker's default failure threshold
    pub failure_threshold: Option<u32>,
    /// Deregistered on a best-effort basis when the registry shuts down
    pub locally_owned: bool,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            auto_renew: false,
            health_check_interval: None,
            initial_status: ServiceStatus::Starting,
            failure_threshold: None,
            locally_owned: false,
        }
    }
}

impl RegistrationOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }

    pub fn with_initial_status(mut self, status: ServiceStatus) -> Self {
        self.initial_status = status;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    pub fn locally_owned(mut self) -> Self {
        self.locally_owned = true;
        self
    }
}

/// Search criteria for registry queries. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct ServiceQuery {
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub status: Option<ServiceStatus>,
}

impl ServiceQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }
}
