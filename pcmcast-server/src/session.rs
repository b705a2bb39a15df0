//! Relay session orchestration
//!
//! A [`Session`] owns the PCM buffer, the client registry and the relay
//! socket, and moves through these states:
//!
//! ```text
//! Idle --start()--> Listening <--> Broadcasting
//!                       \              /
//!                        --shutdown()-> Stopped
//! ```
//!
//! `Broadcasting` just means at least one broadcast run is active; the
//! control listener keeps running throughout. Every task the session spawns
//! is tracked so `shutdown` can wait for it, and aborted if it outlives the
//! grace period. Once `Stopped`, no task holds the socket and it is closed.
//!
//! Enabling broadcast mode sets the auto-broadcast flag before looking at
//! the registry. A client whose `START` lands in between is then served by
//! its own run and possibly also by the all-clients run, never by neither.

use crate::audio::PcmBuffer;
use crate::broadcast::BroadcastEngine;
use crate::error::{Error, Result};
use crate::events::{EventBus, RelayEvent};
use crate::listener::ControlListener;
use crate::registry::ClientRegistry;
use crate::tasks::RunTasks;
use pcmcast_common::config::ServerConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How often shutdown re-checks tasks it has aborted
const ABORT_POLL: Duration = Duration::from_millis(50);

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started: no socket yet
    Idle,
    /// Socket bound, listener running, no broadcast active
    Listening,
    /// Listener running and at least one broadcast run active
    Broadcasting,
    /// Shut down; terminal
    Stopped,
}

/// What enabling broadcast mode did right away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastTrigger {
    /// An all-clients run was spawned
    Started,
    /// Registry empty; only future joiners will be served
    NoClients,
    /// An all-clients run was already active
    InFlight,
}

/// Resources that exist only between `start` and `shutdown`
struct Running {
    engine: Arc<BroadcastEngine>,
    local_addr: SocketAddr,
}

pub struct Session {
    config: ServerConfig,
    pcm: PcmBuffer,
    registry: Arc<ClientRegistry>,
    events: EventBus,
    auto_broadcast: Arc<AtomicBool>,
    tasks: RunTasks,
    shutdown: CancellationToken,
    running: Option<Running>,
    stopped: bool,
}

impl Session {
    /// Idle session around an already loaded buffer
    pub fn new(pcm: PcmBuffer, config: ServerConfig) -> Self {
        Self {
            config,
            pcm,
            registry: Arc::new(ClientRegistry::new()),
            events: EventBus::new(),
            auto_broadcast: Arc::new(AtomicBool::new(false)),
            tasks: RunTasks::new(),
            shutdown: CancellationToken::new(),
            running: None,
            stopped: false,
        }
    }

    /// Decode `path` off the async runtime and build an idle session.
    ///
    /// # Errors
    /// - [`Error::Decode`] if the audio cannot be loaded
    pub async fn load(path: &Path, config: ServerConfig) -> Result<Self> {
        let path_buf = path.to_path_buf();
        let pcm = tokio::task::spawn_blocking(move || PcmBuffer::load(&path_buf))
            .await
            .map_err(|e| Error::Decode(format!("Audio loader task failed: {}", e)))??;

        Ok(Self::new(pcm, config))
    }

    /// Bind the relay socket and start the control listener.
    ///
    /// Returns the bound address (useful when binding port 0). Enables
    /// broadcast mode immediately if the config asks for it.
    ///
    /// # Errors
    /// - [`Error::Bind`] if the address is unavailable
    /// - [`Error::InvalidState`] if the session is not idle
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.state() != SessionState::Idle {
            return Err(Error::InvalidState(format!(
                "Cannot start a session in state {:?}",
                self.state()
            )));
        }

        let bind_addr = self.config.bind_addr;
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        info!("Server UDP listening on {}", local_addr);

        let engine = Arc::new(BroadcastEngine::new(
            Arc::clone(&socket),
            self.pcm.clone(),
            Arc::clone(&self.registry),
            self.events.clone(),
        ));

        let listener = ControlListener::new(
            socket,
            Arc::clone(&self.registry),
            Arc::clone(&engine),
            Arc::clone(&self.auto_broadcast),
            self.tasks.clone(),
            self.events.clone(),
            self.config.recv_timeout,
        );
        self.tasks.spawn(listener.run(self.shutdown.clone()));

        self.running = Some(Running { engine, local_addr });

        if self.config.auto_broadcast {
            self.enable_broadcast_mode().await?;
        }

        Ok(local_addr)
    }

    /// Broadcast to everyone registered now, and to every client that joins
    /// from here on.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] if the session is not running
    pub async fn enable_broadcast_mode(&self) -> Result<BroadcastTrigger> {
        let engine = self.engine()?;

        if !self.auto_broadcast.swap(true, Ordering::AcqRel) {
            info!("Broadcast mode enabled. New clients will automatically receive broadcasts.");
        }

        let connected = self.registry.size().await;
        let trigger = if connected == 0 {
            info!("No clients connected yet. Broadcast will start automatically when clients connect.");
            BroadcastTrigger::NoClients
        } else {
            match engine.try_claim_all_clients() {
                Some(claim) => {
                    info!("Broadcasting to {} connected client(s)...", connected);
                    let engine = Arc::clone(engine);
                    self.tasks.spawn(async move {
                        engine.broadcast_all(claim).await;
                    });
                    BroadcastTrigger::Started
                }
                None => {
                    info!("A broadcast to all clients is already running");
                    BroadcastTrigger::InFlight
                }
            }
        };

        Ok(trigger)
    }

    /// Spawn an all-clients run without touching broadcast mode.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] if the session is not running
    /// - [`Error::BroadcastInFlight`] if an all-clients run is active
    pub fn broadcast_all(&self) -> Result<()> {
        let engine = self.engine()?;
        let claim = engine
            .try_claim_all_clients()
            .ok_or(Error::BroadcastInFlight)?;

        let engine = Arc::clone(engine);
        self.tasks.spawn(async move {
            engine.broadcast_all(claim).await;
        });
        Ok(())
    }

    /// Spawn a targeted run to `targets`.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] if the session is not running
    pub fn broadcast_to(&self, targets: Vec<SocketAddr>) -> Result<()> {
        let engine = Arc::clone(self.engine()?);
        self.tasks.spawn(async move {
            engine.broadcast_to(targets).await;
        });
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        if self.stopped {
            return SessionState::Stopped;
        }
        match &self.running {
            None => SessionState::Idle,
            Some(running) if running.engine.active_runs() > 0 => SessionState::Broadcasting,
            Some(_) => SessionState::Listening,
        }
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_broadcast_mode(&self) -> bool {
        self.auto_broadcast.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn pcm(&self) -> &PcmBuffer {
        &self.pcm
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Stop the listener and wait up to the configured grace period for
    /// in-flight broadcast runs. Runs still going after that are aborted.
    /// When this returns no task holds the socket any more and it is closed.
    ///
    /// Returns `true` if every task finished within the grace period.
    pub async fn shutdown(&mut self) -> bool {
        if self.stopped {
            return true;
        }

        info!("Server shutting down...");
        self.shutdown.cancel();
        self.tasks.close();

        let finished = tokio::time::timeout(self.config.shutdown_grace, self.tasks.wait())
            .await
            .is_ok();

        if !finished {
            let active = self
                .running
                .as_ref()
                .map(|r| r.engine.active_runs())
                .unwrap_or(0);
            warn!("Aborting {} in-flight broadcast run(s)", active);

            // Repeat in case a run was spawned while the first abort went out
            loop {
                self.tasks.abort_all();
                if tokio::time::timeout(ABORT_POLL, self.tasks.wait())
                    .await
                    .is_ok()
                {
                    break;
                }
            }
        }

        self.running = None;
        self.stopped = true;
        info!("Server stopped.");

        finished
    }

    fn engine(&self) -> Result<&Arc<BroadcastEngine>> {
        if self.stopped {
            return Err(Error::InvalidState("Session is stopped".to_string()));
        }
        self.running
            .as_ref()
            .map(|r| &r.engine)
            .ok_or_else(|| Error::InvalidState("Session has not been started".to_string()))
    }
}
