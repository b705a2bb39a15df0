//! Relay lifecycle events
//!
//! Components publish [`RelayEvent`]s on a `tokio::sync::broadcast` channel.
//! Nobody is required to listen: sending with no subscribers is ignored.

use crate::broadcast::{BroadcastReport, BroadcastScope};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event buffer depth; slow subscribers lag rather than block the relay
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// New client registered by `START`
    ClientJoined { addr: SocketAddr, total: usize },
    /// `START` from a client that was already registered
    ClientRejoined { addr: SocketAddr },
    /// Client unregistered by `STOP`
    ClientLeft { addr: SocketAddr, total: usize },
    /// Client unregistered after a failed send in an all-clients run
    ClientDropped { addr: SocketAddr },
    /// A broadcast run began
    BroadcastStarted {
        run_id: Uuid,
        scope: BroadcastScope,
        targets: usize,
    },
    /// A broadcast run reached its end
    BroadcastCompleted {
        run_id: Uuid,
        scope: BroadcastScope,
        report: BroadcastReport,
    },
}

/// Cloneable publishing handle
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event, ignoring the no-subscriber case
    pub fn publish(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
