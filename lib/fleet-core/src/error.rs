use crate::instance::ServiceStatus;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Service instance not found: {0}")]
    NotFound(String),

    #[error("Service instance already registered: {0}")]
    DuplicateId(String),

    #[error("Invalid TTL for {id}: {ttl:?} (must be greater than zero)")]
    InvalidTtl { id: String, ttl: Duration },

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ServiceStatus,
        to: ServiceStatus,
    },

    #[error("Invalid service instance: {0}")]
    InvalidInstance(String),

    #[error("Health probe to {address} timed out after {timeout:?}")]
    ProbeTimeout { address: String, timeout: Duration },

    #[error("Health probe to {address} failed: {reason}")]
    ProbeFailed { address: String, reason: String },

    #[error("Registry store error: {0}")]
    Store(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
