//! Control listener
//!
//! Drains the relay socket's receive side for the lifetime of the session.
//! Each datagram is parsed as a control message:
//! - `START` registers the sender. A new client gets its own targeted
//!   broadcast run when auto-broadcast is on and no all-clients run is in
//!   flight (an all-clients run already picks it up on its next slice).
//! - `STOP` unregisters the sender.
//! - Anything else is logged and dropped.
//!
//! Receives wait at most `recv_timeout` so the loop notices cancellation
//! promptly. No single datagram or socket error can end the loop.

use crate::broadcast::BroadcastEngine;
use crate::events::{EventBus, RelayEvent};
use crate::registry::ClientRegistry;
use crate::tasks::RunTasks;
use pcmcast_common::protocol::CONTROL_BUFFER_SIZE;
use pcmcast_common::ControlMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the listener did with one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// `START` from an unregistered client
    Joined { auto_broadcast: bool },
    /// `START` from a registered client
    Rejoined,
    /// `STOP` from a registered client
    Left,
    /// `STOP` from an unknown client
    UnknownStop,
    /// Not a control message
    Ignored,
}

/// Control-message loop. Cheap to build; consumed by [`ControlListener::run`].
pub struct ControlListener {
    socket: Arc<UdpSocket>,
    registry: Arc<ClientRegistry>,
    engine: Arc<BroadcastEngine>,
    auto_broadcast: Arc<AtomicBool>,
    tasks: RunTasks,
    events: EventBus,
    recv_timeout: Duration,
}

impl ControlListener {
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<ClientRegistry>,
        engine: Arc<BroadcastEngine>,
        auto_broadcast: Arc<AtomicBool>,
        tasks: RunTasks,
        events: EventBus,
        recv_timeout: Duration,
    ) -> Self {
        Self {
            socket,
            registry,
            engine,
            auto_broadcast,
            tasks,
            events,
            recv_timeout,
        }
    }

    /// Receive until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut buf = [0u8; CONTROL_BUFFER_SIZE];
        info!("Control listener started");

        while !shutdown.is_cancelled() {
            let received =
                tokio::time::timeout(self.recv_timeout, self.socket.recv_from(&mut buf)).await;

            match received {
                // No data within the bounded wait
                Err(_) => continue,
                Ok(Ok((len, from))) => {
                    self.handle_datagram(&buf[..len], from).await;
                }
                Ok(Err(e)) => {
                    // e.g. ICMP port-unreachable surfacing as ConnectionReset on Windows
                    warn!("Error receiving control message: {}", e);
                }
            }
        }

        info!("Control listener stopped");
    }

    /// Apply one control datagram from `from`.
    pub async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> ControlOutcome {
        let message = match ControlMessage::parse(datagram) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Ignoring unrecognized message from {} ({} bytes)", from, datagram.len());
                return ControlOutcome::Ignored;
            }
            Err(e) => {
                warn!("Error handling client message from {}: {}", from, e);
                return ControlOutcome::Ignored;
            }
        };

        match message {
            ControlMessage::Start => self.handle_start(from).await,
            ControlMessage::Stop => self.handle_stop(from).await,
        }
    }

    async fn handle_start(&self, from: SocketAddr) -> ControlOutcome {
        let (is_new, total) = self.registry.add_counted(from).await;

        if !is_new {
            info!("Client reconnected: {}", from);
            self.events.publish(RelayEvent::ClientRejoined { addr: from });
            return ControlOutcome::Rejoined;
        }

        info!("Client connected: {} (Total: {})", from, total);
        self.events.publish(RelayEvent::ClientJoined { addr: from, total });

        let auto_broadcast = self.auto_broadcast.load(Ordering::Acquire)
            && !self.engine.is_all_clients_in_flight();

        if auto_broadcast {
            info!("Auto-starting broadcast for new client: {}", from);
            let engine = Arc::clone(&self.engine);
            self.tasks.spawn(async move {
                engine.broadcast_to(vec![from]).await;
            });
        }

        ControlOutcome::Joined { auto_broadcast }
    }

    async fn handle_stop(&self, from: SocketAddr) -> ControlOutcome {
        let (removed, total) = self.registry.remove_counted(&from).await;

        if removed {
            info!("Client disconnected: {} (Total: {})", from, total);
            self.events.publish(RelayEvent::ClientLeft { addr: from, total });
            ControlOutcome::Left
        } else {
            debug!("STOP from unregistered client {}", from);
            ControlOutcome::UnknownStop
        }
    }
}
