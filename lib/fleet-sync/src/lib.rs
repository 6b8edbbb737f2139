//! Discovery to proxy route synchronization

pub mod integrator;
pub mod metric;

pub use integrator::{ProxyDiscoveryIntegrator, SyncConfig, SyncStats};
pub use metric::{ServiceMetricData, StatusChange};
