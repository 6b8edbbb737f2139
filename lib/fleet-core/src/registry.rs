//! Service registry: the single source of truth for instance existence and status

use crate::event::Subscriber;
use crate::store::{PersistedRegistration, RegistryStore};
use crate::{
    CoreError, EventKind, EventStream, RegistrationOptions, Result, ServiceEvent,
    ServiceInstance, ServiceQuery, ServiceStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry tuning knobs
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// How often the expiry sweep runs
    pub sweep_interval: Duration,
    /// Per-subscriber event buffer; events beyond it are dropped for that subscriber
    pub subscriber_buffer: usize,
    /// How long an instance may stay Down before the sweep expires it
    pub down_grace_period: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            subscriber_buffer: 100,
            down_grace_period: Duration::from_secs(30),
        }
    }
}

/// One entry of a registration's status audit trail
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub timestamp: DateTime<Utc>,
    pub from: ServiceStatus,
    pub to: ServiceStatus,
}

struct Registration {
    instance: ServiceInstance,
    options: RegistrationOptions,
    renewed_at: Instant,
    down_since: Option<Instant>,
    history: Vec<StatusTransition>,
    renewal: Option<JoinHandle<()>>,
}

struct RegistryState {
    registrations: HashMap<String, Registration>,
    subscribers: Vec<Subscriber>,
    sequence: u64,
    closed: bool,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    next_subscriber: AtomicU64,
    config: RegistryConfig,
    cancel: CancellationToken,
}

/// ServiceRegistry stores service instances and fans lifecycle events out to subscribers.
///
/// Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_cancellation(config, CancellationToken::new())
    }

    /// Create a registry whose background tasks stop when `cancel` fires
    pub fn with_cancellation(config: RegistryConfig, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    registrations: HashMap::new(),
                    subscribers: Vec::new(),
                    sequence: 0,
                    closed: false,
                }),
                next_subscriber: AtomicU64::new(1),
                config,
                cancel,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Register a new service instance
    pub async fn register(
        &self,
        mut instance: ServiceInstance,
        options: RegistrationOptions,
    ) -> Result<()> {
        if instance.id.is_empty() {
            return Err(CoreError::InvalidInstance("instance id is empty".to_string()));
        }
        if instance.name.is_empty() {
            return Err(CoreError::InvalidInstance(format!(
                "instance {} has no service name",
                instance.id
            )));
        }
        if options.ttl.is_zero() {
            return Err(CoreError::InvalidTtl {
                id: instance.id,
                ttl: options.ttl,
            });
        }
        if options.initial_status == ServiceStatus::Deregistered {
            return Err(CoreError::InvalidTransition {
                id: instance.id,
                from: ServiceStatus::Starting,
                to: ServiceStatus::Deregistered,
            });
        }

        let mut state = self.inner.state.lock().await;
        if state.registrations.contains_key(&instance.id) {
            return Err(CoreError::DuplicateId(instance.id));
        }

        let now = Instant::now();
        instance.status = options.initial_status;
        instance.last_renewal = Utc::now();

        let renewal = if options.auto_renew {
            Some(self.spawn_renewal(instance.id.clone(), options.ttl))
        } else {
            None
        };

        let id = instance.id.clone();
        let snapshot = instance.clone();
        state.registrations.insert(
            id.clone(),
            Registration {
                down_since: (instance.status == ServiceStatus::Down).then_some(now),
                instance,
                options,
                renewed_at: now,
                history: Vec::new(),
                renewal,
            },
        );
        Self::emit(&mut state, EventKind::Register, snapshot);

        info!(service_id = %id, "Registered service instance");
        Ok(())
    }

    /// Remove a service instance
    pub async fn deregister(&self, id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !Self::remove(&mut state, id, EventKind::Deregister) {
            return Err(CoreError::NotFound(id.to_string()));
        }
        info!(service_id = %id, "Deregistered service instance");
        Ok(())
    }

    /// Apply a status transition and emit an Update event.
    ///
    /// Setting the current status again is a no-op.
    pub async fn update_status(&self, id: &str, status: ServiceStatus) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        Self::apply_status(&mut state, id, status)
    }

    /// Refresh a registration's TTL
    pub async fn renew(&self, id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let registration = state
            .registrations
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        registration.renewed_at = Instant::now();
        registration.instance.last_renewal = Utc::now();
        debug!(service_id = %id, "Renewed registration");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<ServiceInstance> {
        let state = self.inner.state.lock().await;
        state
            .registrations
            .get(id)
            .map(|r| r.instance.clone())
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    /// All instances, ordered by id
    pub async fn list(&self) -> Vec<ServiceInstance> {
        self.query(&ServiceQuery::default()).await
    }

    pub async fn instances_by_name(&self, name: &str) -> Vec<ServiceInstance> {
        self.query(&ServiceQuery::by_name(name)).await
    }

    /// Instances matching every criterion of `query`, ordered by id
    pub async fn query(&self, query: &ServiceQuery) -> Vec<ServiceInstance> {
        let state = self.inner.state.lock().await;
        let mut matches: Vec<ServiceInstance> = state
            .registrations
            .values()
            .filter(|r| r.instance.matches(query))
            .map(|r| r.instance.clone())
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
    }

    /// All instances plus the sequence number of the last event emitted,
    /// read under one lock
    pub async fn snapshot(&self) -> (Vec<ServiceInstance>, u64) {
        let state = self.inner.state.lock().await;
        let mut instances: Vec<ServiceInstance> =
            state.registrations.values().map(|r| r.instance.clone()).collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        (instances, state.sequence)
    }

    /// Instances together with the options they were registered with
    pub async fn registrations(&self) -> Vec<(ServiceInstance, RegistrationOptions)> {
        let state = self.inner.state.lock().await;
        let mut entries: Vec<_> = state
            .registrations
            .values()
            .map(|r| (r.instance.clone(), r.options.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        entries
    }

    pub async fn registration(&self, id: &str) -> Result<(ServiceInstance, RegistrationOptions)> {
        let state = self.inner.state.lock().await;
        state
            .registrations
            .get(id)
            .map(|r| (r.instance.clone(), r.options.clone()))
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    pub async fn status_history(&self, id: &str) -> Result<Vec<StatusTransition>> {
        let state = self.inner.state.lock().await;
        state
            .registrations
            .get(id)
            .map(|r| r.history.clone())
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.registrations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Open a new event subscription
    pub async fn subscribe(&self) -> EventStream {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (subscriber, stream) = Subscriber::channel(id, self.inner.config.subscriber_buffer);

        let mut state = self.inner.state.lock().await;
        if state.closed {
            // Dropping the sender hands back an already-closed stream
            drop(subscriber);
        } else {
            state.subscribers.push(subscriber);
            debug!(subscriber_id = id, "New event subscription");
        }
        stream
    }

    /// Detach a subscription. Events already buffered stay readable.
    pub async fn unsubscribe(&self, stream_id: u64) {
        let mut state = self.inner.state.lock().await;
        state.subscribers.retain(|s| s.id != stream_id);
        debug!(subscriber_id = stream_id, "Event subscription closed");
    }

    /// Remove every instance whose TTL or down grace period has elapsed.
    ///
    /// A TTL expiry that finds the instance not yet Down first emits Update(Down).
    /// Returns the number of instances expired.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let grace = self.inner.config.down_grace_period;
        let mut state = self.inner.state.lock().await;

        let mut expired: Vec<(String, bool)> = state
            .registrations
            .iter()
            .filter_map(|(id, r)| {
                let ttl_lapsed = !r.options.auto_renew
                    && now.duration_since(r.renewed_at) >= r.options.ttl;
                let grace_lapsed = r
                    .down_since
                    .map(|since| now.duration_since(since) >= grace)
                    .unwrap_or(false);
                (ttl_lapsed || grace_lapsed).then(|| (id.clone(), ttl_lapsed))
            })
            .collect();
        expired.sort();

        for (id, ttl_lapsed) in &expired {
            if *ttl_lapsed {
                warn!(service_id = %id, "Registration TTL elapsed without renewal");
                if let Err(e) = Self::apply_status(&mut state, id, ServiceStatus::Down) {
                    warn!(service_id = %id, "Failed to mark expiring instance down: {}", e);
                }
            }
            Self::remove(&mut state, id, EventKind::Expire);
            info!(service_id = %id, "Expired service instance");
        }

        if !expired.is_empty() {
            debug!("Expiry sweep removed {} instances", expired.len());
        }
        expired.len()
    }

    /// Run the expiry sweep every `sweep_interval` until cancelled
    pub fn start_expiry_sweep(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep_expired().await;
                    }
                }
            }
            debug!("Expiry sweep stopped");
        })
    }

    /// Re-register everything a store holds. Returns how many were restored.
    pub async fn restore_from(&self, store: &dyn RegistryStore) -> Result<usize> {
        let persisted = store.load()?;
        let mut restored = 0;
        for entry in persisted {
            let mut options = entry.options;
            if entry.instance.status != ServiceStatus::Deregistered {
                options.initial_status = entry.instance.status;
            }
            let id = entry.instance.id.clone();
            match self.register(entry.instance, options).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(service_id = %id, "Skipping persisted registration: {}", e),
            }
        }
        info!("Restored {} registrations from store", restored);
        Ok(restored)
    }

    /// Save the current registrations
    pub async fn persist_to(&self, store: &dyn RegistryStore) -> Result<()> {
        let entries: Vec<PersistedRegistration> = self
            .registrations()
            .await
            .into_iter()
            .map(|(instance, options)| PersistedRegistration { instance, options })
            .collect();
        store.save(&entries)
    }

    /// Stop background work, deregister locally-owned instances and close subscriptions.
    ///
    /// Subscribers still receive every event buffered before the close.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let mut state = self.inner.state.lock().await;
        let mut local: Vec<String> = state
            .registrations
            .values()
            .filter(|r| r.options.locally_owned)
            .map(|r| r.instance.id.clone())
            .collect();
        local.sort();
        for id in &local {
            Self::remove(&mut state, id, EventKind::Deregister);
        }
        for registration in state.registrations.values_mut() {
            if let Some(handle) = registration.renewal.take() {
                handle.abort();
            }
        }

        state.subscribers.clear();
        state.closed = true;
        info!(
            "Registry shut down ({} local instances deregistered)",
            local.len()
        );
    }

    fn apply_status(state: &mut RegistryState, id: &str, status: ServiceStatus) -> Result<()> {
        let registration = state
            .registrations
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;

        let current = registration.instance.status;
        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(CoreError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: status,
            });
        }

        registration.instance.status = status;
        registration.down_since = match status {
            ServiceStatus::Down => Some(Instant::now()),
            _ => None,
        };
        registration.history.push(StatusTransition {
            timestamp: Utc::now(),
            from: current,
            to: status,
        });
        let snapshot = registration.instance.clone();
        Self::emit(state, EventKind::Update, snapshot);

        info!(service_id = %id, "Status changed: {} -> {}", current, status);
        Ok(())
    }

    fn remove(state: &mut RegistryState, id: &str, kind: EventKind) -> bool {
        let Some(mut registration) = state.registrations.remove(id) else {
            return false;
        };
        if let Some(handle) = registration.renewal.take() {
            handle.abort();
        }
        registration.instance.status = ServiceStatus::Deregistered;
        Self::emit(state, kind, registration.instance);
        true
    }

    /// Fan an event out under the state lock so every subscriber sees events in
    /// mutation order. `try_send` never waits: a full buffer drops the event for
    /// that subscriber, so writers are never held up by a slow reader.
    fn emit(state: &mut RegistryState, kind: EventKind, instance: ServiceInstance) {
        state.sequence += 1;
        let event = ServiceEvent {
            kind,
            instance,
            timestamp: Utc::now(),
            sequence: state.sequence,
        };
        debug!(
            service_id = %event.instance.id,
            sequence = event.sequence,
            "Publishing {} event",
            kind
        );
        state.subscribers.retain(|s| s.deliver(event.clone()));
    }

    fn spawn_renewal(&self, id: String, ttl: Duration) -> JoinHandle<()> {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let period = (ttl / 2).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let registry = ServiceRegistry { inner };
                if registry.renew(&id).await.is_err() {
                    break;
                }
            }
        })
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
