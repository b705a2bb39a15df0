//! Broadcast engine
//!
//! A broadcast run walks the whole [`PcmBuffer`] in 1020-byte slices and
//! sends each packet to every target before moving to the next slice.
//! Sequence numbers restart at zero for every run.
//!
//! Two kinds of run:
//! - **All clients**: targets are re-read from the registry before every
//!   slice. Addresses whose send fails are removed from the registry after
//!   that slice. At most one such run is in flight at a time.
//! - **Targeted**: a fixed address list (a newly joined client). Failures
//!   drop the address from the rest of the run only; the registry is left to
//!   the control listener. Any number may overlap.
//!
//! There is no pacing between slices: packets go out as fast as the socket
//! accepts them.

use crate::audio::PcmBuffer;
use crate::error::{Error, Result};
use crate::events::{EventBus, RelayEvent};
use crate::packetizer::{packet_count, Packets};
use crate::registry::ClientRegistry;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound half of the relay socket.
///
/// Implemented by `tokio::net::UdpSocket`; tests substitute recording or
/// failing sinks.
pub trait DatagramSink: Send + Sync + 'static {
    fn send_datagram(
        &self,
        datagram: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;
}

impl DatagramSink for UdpSocket {
    fn send_datagram(
        &self,
        datagram: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send {
        self.send_to(datagram, target)
    }
}

/// Which target set a run sends to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastScope {
    AllClients,
    Targeted,
}

impl std::fmt::Display for BroadcastScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastScope::AllClients => f.write_str("all-clients"),
            BroadcastScope::Targeted => f.write_str("targeted"),
        }
    }
}

/// Outcome of one run. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Payload bytes covered by the run
    pub bytes_sent: usize,
    /// Packets produced (sequence numbers used)
    pub packets_sent: usize,
    /// Successful `send` calls across all targets
    pub datagrams_delivered: usize,
    /// Targets that failed during the run, in failure order
    pub failed: Vec<SocketAddr>,
    /// True if the run reached the end of the buffer
    pub completed: bool,
}

/// Exclusive right to start an all-clients run.
///
/// Obtained from [`BroadcastEngine::try_claim_all_clients`]. The in-flight
/// flag stays set until the claim is dropped, which happens when the run it
/// is passed to finishes.
#[derive(Debug)]
pub struct AllClientsClaim {
    flag: Arc<AtomicBool>,
}

impl Drop for AllClientsClaim {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Counts a run as active while alive
struct ActiveRun(Arc<AtomicUsize>);

impl ActiveRun {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Sends the PCM buffer to clients. Share it by `Arc` between the session,
/// the control listener, and spawned runs.
pub struct BroadcastEngine<S = UdpSocket> {
    sink: Arc<S>,
    pcm: PcmBuffer,
    registry: Arc<ClientRegistry>,
    events: EventBus,
    all_clients_in_flight: Arc<AtomicBool>,
    active_runs: Arc<AtomicUsize>,
}

impl<S: DatagramSink> BroadcastEngine<S> {
    pub fn new(
        sink: Arc<S>,
        pcm: PcmBuffer,
        registry: Arc<ClientRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            sink,
            pcm,
            registry,
            events,
            all_clients_in_flight: Arc::new(AtomicBool::new(false)),
            active_runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// True while an all-clients run holds its claim
    pub fn is_all_clients_in_flight(&self) -> bool {
        self.all_clients_in_flight.load(Ordering::Acquire)
    }

    /// Number of runs currently executing, of either kind
    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::Acquire)
    }

    /// Reserve the all-clients slot, or `None` if a run already holds it.
    ///
    /// Lets a caller reserve synchronously before spawning the run.
    pub fn try_claim_all_clients(&self) -> Option<AllClientsClaim> {
        self.all_clients_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| AllClientsClaim {
                flag: Arc::clone(&self.all_clients_in_flight),
            })
    }

    /// Send the whole buffer to `targets`, or to every registered client
    /// when `targets` is `None`.
    ///
    /// # Errors
    /// - [`Error::BroadcastInFlight`] for an all-clients request while
    ///   another all-clients run is active
    pub async fn broadcast(&self, targets: Option<Vec<SocketAddr>>) -> Result<BroadcastReport> {
        match targets {
            Some(targets) => Ok(self.broadcast_to(targets).await),
            None => {
                let claim = self
                    .try_claim_all_clients()
                    .ok_or(Error::BroadcastInFlight)?;
                Ok(self.broadcast_all(claim).await)
            }
        }
    }

    /// All-clients run under a previously obtained claim
    pub async fn broadcast_all(&self, claim: AllClientsClaim) -> BroadcastReport {
        let report = self.run(BroadcastScope::AllClients, Vec::new()).await;
        drop(claim);
        report
    }

    /// Targeted run. The registry is never modified.
    pub async fn broadcast_to(&self, mut targets: Vec<SocketAddr>) -> BroadcastReport {
        targets.sort();
        targets.dedup();
        self.run(BroadcastScope::Targeted, targets).await
    }

    async fn run(&self, scope: BroadcastScope, mut targets: Vec<SocketAddr>) -> BroadcastReport {
        let _active = ActiveRun::enter(&self.active_runs);
        let run_id = Uuid::new_v4();

        let initial_targets = match scope {
            BroadcastScope::AllClients => {
                let count = self.registry.size().await;
                info!(%run_id, "Starting audio broadcast to all clients ({} connected)", count);
                count
            }
            BroadcastScope::Targeted => {
                info!(%run_id, "Starting audio broadcast to {} client(s)", targets.len());
                targets.len()
            }
        };

        self.events.publish(RelayEvent::BroadcastStarted {
            run_id,
            scope,
            targets: initial_targets,
        });

        let mut report = BroadcastReport::default();
        let total_packets = packet_count(self.pcm.len());

        for packet in Packets::new(self.pcm.as_bytes()) {
            match scope {
                BroadcastScope::AllClients => {
                    let clients = self.registry.snapshot().await;
                    if clients.is_empty() {
                        info!(%run_id, "No clients left, ending broadcast");
                        break;
                    }

                    let failed = self.send_to_each(&packet.bytes, &clients, &mut report).await;

                    // Unreachable clients are treated as disconnected
                    for addr in failed {
                        if self.registry.remove(&addr).await {
                            info!(%run_id, "Removed disconnected client: {}", addr);
                            self.events.publish(RelayEvent::ClientDropped { addr });
                        }
                        report.failed.push(addr);
                    }
                }
                BroadcastScope::Targeted => {
                    if targets.is_empty() {
                        break;
                    }

                    let failed = self.send_to_each(&packet.bytes, &targets, &mut report).await;
                    if !failed.is_empty() {
                        targets.retain(|t| !failed.contains(t));
                        report.failed.extend(failed);
                    }
                }
            }

            report.bytes_sent += packet.payload_len;
            report.packets_sent += 1;
        }

        report.completed = report.packets_sent == total_packets;

        if report.completed {
            info!(
                %run_id,
                "Audio broadcast complete. Sent {} bytes in {} packets.",
                report.bytes_sent, report.packets_sent
            );
        } else {
            warn!(
                %run_id,
                "Audio broadcast ended early after {} of {} packets",
                report.packets_sent, total_packets
            );
        }

        self.events.publish(RelayEvent::BroadcastCompleted {
            run_id,
            scope,
            report: report.clone(),
        });

        report
    }

    /// Send one datagram to every target; returns the targets that failed.
    async fn send_to_each(
        &self,
        datagram: &[u8],
        targets: &[SocketAddr],
        report: &mut BroadcastReport,
    ) -> Vec<SocketAddr> {
        let mut failed = Vec::new();

        for &target in targets {
            match self.sink.send_datagram(datagram, target).await {
                Ok(_) => report.datagrams_delivered += 1,
                Err(e) => {
                    warn!("Error sending to {}: {}", target, e);
                    failed.push(target);
                }
            }
        }

        if !failed.is_empty() {
            debug!("{} of {} sends failed for this slice", failed.len(), targets.len());
        }

        failed
    }
}
