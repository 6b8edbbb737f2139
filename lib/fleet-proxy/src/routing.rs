//! Proxy routing table: path patterns mapped to balanced upstream targets

use crate::load_balancer::{LoadBalancer, LoadBalancingStrategy};
use crate::{ProxyError, Result};
use hyper::Uri;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One upstream a route can send traffic to
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Target {
    pub url: String,
    pub weight: u32,
    /// Registry instance backing this target, if any
    pub instance_id: Option<String>,
}

impl Target {
    /// Validate a target URL. It must carry both a scheme and an authority.
    pub fn parse(url: &str, weight: u32, instance_id: Option<String>) -> Result<Self> {
        let uri = url.parse::<Uri>().map_err(|e| ProxyError::InvalidTarget {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if uri.scheme().is_none() {
            return Err(ProxyError::InvalidTarget {
                url: url.to_string(),
                reason: "missing scheme".to_string(),
            });
        }
        match uri.authority() {
            Some(authority) if !authority.host().is_empty() => {}
            _ => {
                return Err(ProxyError::InvalidTarget {
                    url: url.to_string(),
                    reason: "missing host".to_string(),
                })
            }
        }

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            weight,
            instance_id,
        })
    }
}

/// Snapshot of a route as exposed to callers
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteEntry {
    pub path: String,
    pub targets: Vec<Target>,
    pub load_balancing_enabled: bool,
}

/// Immutable route plus its selection state. Replaced wholesale on update.
#[derive(Debug)]
struct Route {
    entry: RouteEntry,
    balancer: LoadBalancer,
}

impl Route {
    fn select(&self) -> Option<&Target> {
        if !self.entry.load_balancing_enabled {
            return self.entry.targets.first();
        }
        self.balancer
            .next_index()
            .and_then(|i| self.entry.targets.get(i))
    }
}

/// Routing table consulted by the dispatch path and written by the sync layer
pub struct RoutingTable {
    routes: RwLock<HashMap<String, Arc<Route>>>,
    strategy: LoadBalancingStrategy,
}

impl RoutingTable {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            strategy,
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Replace the route at `path` with a new target set
    pub async fn update_route(
        &self,
        path: &str,
        targets: Vec<Target>,
        load_balancing_enabled: bool,
    ) -> Result<()> {
        if targets.is_empty() {
            return Err(ProxyError::EmptyTargets(path.to_string()));
        }

        let weights: Vec<u32> = targets.iter().map(|t| t.weight).collect();
        let route = Route {
            balancer: LoadBalancer::new(self.strategy, &weights),
            entry: RouteEntry {
                path: path.to_string(),
                targets,
                load_balancing_enabled,
            },
        };

        debug!(
            "Updating route {} with {} targets",
            path,
            route.entry.targets.len()
        );
        self.routes
            .write()
            .await
            .insert(path.to_string(), Arc::new(route));
        Ok(())
    }

    /// Remove the route at `path`. Returns whether it existed.
    pub async fn remove_route(&self, path: &str) -> bool {
        let removed = self.routes.write().await.remove(path).is_some();
        if removed {
            info!("Removed route {}", path);
        }
        removed
    }

    pub async fn route(&self, path: &str) -> Option<RouteEntry> {
        self.routes.read().await.get(path).map(|r| r.entry.clone())
    }

    /// All routes, ordered by path
    pub async fn routes(&self) -> Vec<RouteEntry> {
        let mut routes: Vec<RouteEntry> = self
            .routes
            .read()
            .await
            .values()
            .map(|r| r.entry.clone())
            .collect();
        routes.sort_by(|a, b| a.path.cmp(&b.path));
        routes
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }

    /// Pick a target for a request path using the most specific matching route
    pub async fn resolve(&self, request_path: &str) -> Result<Target> {
        let route = {
            let routes = self.routes.read().await;
            routes
                .iter()
                .filter(|(pattern, _)| match_path(request_path, pattern))
                .max_by_key(|(pattern, _)| specificity(pattern))
                .map(|(_, route)| route.clone())
        };

        route
            .as_ref()
            .and_then(|r| r.select().cloned())
            .ok_or_else(|| ProxyError::RouteNotFound(request_path.to_string()))
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(LoadBalancingStrategy::default())
    }
}

/// Match a request path against a route pattern.
///
/// Patterns are exact paths, prefixes ending in `/`, or prefixes ending in `/*`.
pub fn match_path(path: &str, pattern: &str) -> bool {
    // Exact match
    if pattern == path {
        return true;
    }

    // Prefix match with wildcard
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path == prefix || path.starts_with(&format!("{}/", prefix));
    }

    // Prefix match
    pattern.ends_with('/') && path.starts_with(pattern)
}

/// Longer literal prefixes win; an exact pattern beats a wildcard of equal length
fn specificity(pattern: &str) -> (usize, bool) {
    let literal = pattern.trim_end_matches('*');
    (literal.len(), !pattern.ends_with('*') && !pattern.ends_with('/'))
}
