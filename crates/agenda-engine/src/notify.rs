//! Domain events emitted after a mutation commits.
//!
//! Downstream collaborators (the financial ledger, mostly) subscribe to these
//! instead of hooking into persistence. Delivery is best effort: a failing
//! sink never undoes a committed write.

use std::sync::{mpsc, Mutex};

use serde::Serialize;

use crate::model::{EventStatus, TenantId};
use crate::reference::EventRef;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// The resolved status of a standalone event, a series master or a
    /// materialized occurrence changed.
    StatusChanged {
        tenant: TenantId,
        target: EventRef,
        previous: Option<EventStatus>,
        current: EventStatus,
    },
}

impl DomainEvent {
    /// Entered `realized`: the ledger should record a charge.
    pub fn is_realization(&self) -> bool {
        match self {
            Self::StatusChanged {
                previous, current, ..
            } => *current == EventStatus::Realized && *previous != Some(EventStatus::Realized),
        }
    }

    /// Left `realized`: the ledger should drop the charge.
    pub fn is_unrealization(&self) -> bool {
        match self {
            Self::StatusChanged {
                previous, current, ..
            } => *previous == Some(EventStatus::Realized) && *current != EventStatus::Realized,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink lock poisoned")]
    Poisoned,
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &DomainEvent) -> Result<(), SinkError>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &DomainEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Logs every event at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &DomainEvent) -> Result<(), SinkError> {
        match event {
            DomainEvent::StatusChanged {
                tenant,
                target,
                previous,
                current,
            } => tracing::info!(
                %tenant,
                %target,
                previous = previous.map(EventStatus::as_str),
                current = current.as_str(),
                realized = event.is_realization(),
                "status changed"
            ),
        }
        Ok(())
    }
}

/// In-process fan-out over `mpsc` channels.
///
/// Every subscriber receives every event published after it subscribed.
/// Dropped receivers are pruned on the next publish.
#[derive(Debug, Default)]
pub struct ChannelSink {
    subscribers: Mutex<Vec<mpsc::Sender<DomainEvent>>>,
}

impl ChannelSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<DomainEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: &DomainEvent) -> Result<(), SinkError> {
        let mut subs = self.subscribers.lock().map_err(|_| SinkError::Poisoned)?;
        subs.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }
}
