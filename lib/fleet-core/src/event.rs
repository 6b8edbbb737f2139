//! Lifecycle events emitted by the registry

use crate::ServiceInstance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// Kind of lifecycle change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Register,
    Update,
    Deregister,
    Expire,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Register => "register",
            EventKind::Update => "update",
            EventKind::Deregister => "deregister",
            EventKind::Expire => "expire",
        }
    }

    /// Deregister and Expire both take the instance out of service
    pub fn is_removal(&self) -> bool {
        matches!(self, EventKind::Deregister | EventKind::Expire)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one registry change
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub kind: EventKind,
    pub instance: ServiceInstance,
    pub timestamp: DateTime<Utc>,
    /// Registry-wide emission order
    pub sequence: u64,
}

/// Receiving half of a registry subscription
pub struct EventStream {
    id: u64,
    receiver: mpsc::Receiver<ServiceEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        self.receiver.recv().await
    }

    /// Take an already-buffered event without waiting
    pub fn try_recv(&mut self) -> Option<ServiceEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Events discarded because this subscriber's buffer was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Sending half kept by the registry
pub(crate) struct Subscriber {
    pub(crate) id: u64,
    sender: mpsc::Sender<ServiceEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscriber {
    pub(crate) fn channel(id: u64, capacity: usize) -> (Subscriber, EventStream) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        (
            Subscriber {
                id,
                sender,
                dropped: dropped.clone(),
            },
            EventStream {
                id,
                receiver,
                dropped,
            },
        )
    }

    /// Non-blocking delivery. Returns false once the receiver is gone.
    pub(crate) fn deliver(&self, event: ServiceEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
