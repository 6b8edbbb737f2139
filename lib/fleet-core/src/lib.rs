//! Core service discovery functionality
//!
//! This library provides:
//! - Service registry with TTL expiry and lifecycle event fan-out
//! - Active health checking that drives instance status
//! - Optional persistence of registrations

pub mod error;
pub mod event;
pub mod health;
pub mod instance;
pub mod registry;
pub mod store;

pub use error::{CoreError, Result};
pub use event::{EventKind, EventStream, ServiceEvent};
pub use health::{
    HealthCheckConfig, HealthChecker, HealthStats, HttpProber, ProbeOutcome, Prober, TcpProber,
};
pub use instance::{RegistrationOptions, ServiceInstance, ServiceQuery, ServiceStatus};
pub use registry::{RegistryConfig, ServiceRegistry, StatusTransition};
pub use store::{JsonFileStore, PersistedRegistration, RegistryStore};
