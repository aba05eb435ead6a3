//! # Lifecycle event bus
//!
//! Broadcast channel carrying [`LifecycleEvent`]s for every unit in the tree.
//! Faults raised inside a unit's task surface here and in the owning
//! container's fault log, never at the call site that spawned the unit.
//!
//! Publishing never fails: an event published while nobody is subscribed is
//! simply dropped. Subscribers that fall behind by more than the channel
//! capacity receive [`EventError::Lagged`] once and continue from the oldest
//! retained event.

use chrono::{DateTime, Utc};
use futures::Stream;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::trace;

use crate::unit::UnitKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum LifecycleEventType {
    UnitLoading,
    UnitStarted,
    UnitStopping,
    UnitUnloaded,
    UnitFaulted,
    AgentStarted,
    AgentStopping,
    AgentStopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub event_type: LifecycleEventType,
    /// Full path of the unit (`"program/plugin"`), empty for agent events.
    pub path: String,
    pub kind: Option<UnitKind>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(event_type: LifecycleEventType, path: &str) -> Self {
        Self {
            event_type,
            path: path.to_string(),
            kind: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn agent(event_type: LifecycleEventType) -> Self {
        Self::new(event_type, "")
    }

    pub fn with_kind(mut self, kind: UnitKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_detail<S: Into<String>>(mut self, detail: S) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Receiver lagged behind by {count} events")]
    Lagged { count: u64 },
    #[error("Event bus closed")]
    Closed,
}

pub type EventResult<T> = Result<T, EventError>;

pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe())
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        trace!("publishing {} for {:?}", event.event_type, event.path);
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<LifecycleEvent>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<LifecycleEvent>) -> Self {
        Self { receiver }
    }

    /// Receives the next event. On lag the receiver is resubscribed and the
    /// number of skipped events is reported once.
    pub async fn recv(&mut self) -> EventResult<LifecycleEvent> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count })
            }
            Err(broadcast::error::RecvError::Closed) => Err(EventError::Closed),
        }
    }

    /// Stream view of the receiver; lagged gaps are skipped silently.
    pub fn into_stream(self) -> impl Stream<Item = LifecycleEvent> + Send + Unpin {
        BroadcastStream::new(self.receiver).filter_map(|event| event.ok())
    }
}
