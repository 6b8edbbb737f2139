//! Routing table, load balancing and request forwarding for the fleet gateway

pub mod error;
pub mod forwarder;
pub mod load_balancer;
pub mod metrics;
pub mod routing;

pub use error::{ProxyError, Result};
pub use forwarder::RequestForwarder;
pub use load_balancer::{LoadBalancer, LoadBalancingStrategy};
pub use metrics::MetricsCollector;
pub use routing::{match_path, RouteEntry, RoutingTable, Target};
