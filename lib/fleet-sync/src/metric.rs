//! Per-instance availability and request metrics

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleet_core::ServiceStatus;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// One observed status change
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusChange {
    pub timestamp: DateTime<Utc>,
    /// Absent for the first observation of an instance
    pub old_status: Option<ServiceStatus>,
    pub new_status: ServiceStatus,
}

/// Availability and traffic figures for one instance
#[derive(Clone, Debug, Serialize)]
pub struct ServiceMetricData {
    pub service_id: String,
    pub service_name: String,
    pub last_seen: DateTime<Utc>,
    pub status: ServiceStatus,
    pub request_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub available_time: Duration,
    pub down_time: Duration,
    pub status_history: Vec<StatusChange>,
    #[serde(skip)]
    accrued_at: Instant,
    /// When the instance left the registry; the entry is evicted after retention
    #[serde(skip)]
    removed_at: Option<Instant>,
}

impl ServiceMetricData {
    pub(crate) fn new(service_id: &str, service_name: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            service_name: service_name.to_string(),
            last_seen: Utc::now(),
            status: ServiceStatus::Starting,
            request_count: 0,
            error_count: 0,
            last_error: None,
            last_error_at: None,
            available_time: Duration::ZERO,
            down_time: Duration::ZERO,
            status_history: Vec::new(),
            accrued_at: Instant::now(),
            removed_at: None,
        }
    }

    /// Fraction of observed time spent Up, `None` before any time accrued
    pub fn availability(&self) -> Option<f64> {
        let total = self.available_time + self.down_time;
        if total.is_zero() {
            return None;
        }
        Some(self.available_time.as_secs_f64() / total.as_secs_f64())
    }

    /// Credit the time since the last accrual to the last-known status
    pub(crate) fn accrue(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.accrued_at);
        if self.status == ServiceStatus::Up {
            self.available_time += elapsed;
        } else {
            self.down_time += elapsed;
        }
        self.accrued_at = now;
        self.last_seen = Utc::now();
    }

    /// Append a history entry if the status actually changed.
    ///
    /// Timestamps are nudged forward so the history stays strictly increasing
    /// even when the wall clock stalls or steps back.
    pub(crate) fn observe_status(&mut self, status: ServiceStatus, at: DateTime<Utc>) -> bool {
        let old_status = self.status_history.last().map(|c| c.new_status);
        if old_status == Some(status) {
            return false;
        }

        let timestamp = match self.status_history.last() {
            Some(last) if at <= last.timestamp => last.timestamp + ChronoDuration::microseconds(1),
            _ => at,
        };
        self.status_history.push(StatusChange {
            timestamp,
            old_status,
            new_status: status,
        });
        self.status = status;
        true
    }

    pub(crate) fn set_removed(&mut self, removed: bool, now: Instant) {
        self.removed_at = removed.then_some(now);
    }

    /// Whether a removed instance has been gone longer than `retention`
    pub(crate) fn retention_elapsed(&self, now: Instant, retention: Duration) -> bool {
        self.removed_at
            .map(|at| now.saturating_duration_since(at) >= retention)
            .unwrap_or(false)
    }

    pub(crate) fn record_request(&mut self, success: bool, error: Option<&str>) {
        self.request_count += 1;
        if !success {
            self.error_count += 1;
            self.record_error(error.unwrap_or("request failed"));
        }
    }

    pub(crate) fn record_error(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Utc::now());
    }
}
