//! Relay stream receiver
//!
//! Subscribes to a relay server with `START`, feeds every audio packet through
//! a [`JitterBuffer`] into an [`AudioSink`], and unsubscribes with `STOP`
//! when the stream ends. The protocol has no end-of-stream marker: once the
//! first packet has arrived, `idle_timeout` without a packet ends the stream.

use crate::error::{Error, Result};
use crate::jitter::{JitterBuffer, Released, DEFAULT_DEPTH};
use crate::sink::AudioSink;
use pcmcast_common::protocol::{MAX_PACKET_SIZE, PAYLOAD_SIZE};
use pcmcast_common::{AudioPacket, ControlMessage};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SILENCE: [u8; PAYLOAD_SIZE] = [0u8; PAYLOAD_SIZE];

/// Receiver settings
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub server: SocketAddr,
    /// Bounded wait of each receive
    pub recv_wait: Duration,
    /// Silence after the first packet that ends the stream
    pub idle_timeout: Duration,
    pub jitter_depth: usize,
}

impl ListenConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            recv_wait: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(2),
            jitter_depth: DEFAULT_DEPTH,
        }
    }
}

/// Summary of one recording
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiveStats {
    pub received: u64,
    pub lost: u64,
    pub late: u64,
    pub duplicate: u64,
    /// Packets dropped for jumping too far ahead of the stream
    pub out_of_range: u64,
    /// Datagrams that were not valid audio packets
    pub malformed: u64,
    pub bytes_written: u64,
    /// Ended by cancellation rather than by the idle timeout
    pub interrupted: bool,
}

pub struct Receiver {
    socket: UdpSocket,
    config: ListenConfig,
}

impl Receiver {
    /// Bind an ephemeral port of the server's address family
    pub async fn bind(config: ListenConfig) -> Result<Self> {
        let local: IpAddr = match config.server {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
        debug!("Client bound to {}", socket.local_addr()?);

        Ok(Self { socket, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Record the stream into `sink` until it goes idle or `shutdown` fires.
    ///
    /// `STOP` is sent on the way out in both cases.
    pub async fn run<S: AudioSink>(
        &self,
        sink: &mut S,
        shutdown: CancellationToken,
    ) -> Result<ReceiveStats> {
        let server = self.config.server;
        self.send_control(ControlMessage::Start).await?;
        info!("Sent 'START' to server {}", server);

        let mut jitter = JitterBuffer::new(self.config.jitter_depth);
        let mut stats = ReceiveStats::default();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut last_packet: Option<Instant> = None;
        let wait = self.config.recv_wait.min(self.config.idle_timeout);

        let outcome = loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    stats.interrupted = true;
                    break Ok(());
                }
                received = tokio::time::timeout(wait, self.socket.recv_from(&mut buf)) => received,
            };

            match received {
                Err(_) => {
                    if last_packet.is_some_and(|t| t.elapsed() >= self.config.idle_timeout) {
                        info!("No packets for {:?}, end of stream", self.config.idle_timeout);
                        break Ok(());
                    }
                }
                Ok(Ok((len, from))) => {
                    if from != server {
                        debug!("Ignoring datagram from {}", from);
                        continue;
                    }
                    let packet = match AudioPacket::decode(&buf[..len]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            stats.malformed += 1;
                            warn!("Bad packet from {}: {}", from, e);
                            continue;
                        }
                    };
                    if last_packet.is_none() {
                        info!("Stream started at sequence {}", packet.sequence);
                    }
                    last_packet = Some(Instant::now());

                    let released = jitter.push(packet.sequence, packet.payload.to_vec());
                    if let Err(e) = write_released(sink, released) {
                        break Err(e);
                    }
                }
                Ok(Err(e)) => {
                    warn!("Error receiving packet: {}", e);
                }
            }
        };

        let flushed = outcome.and_then(|()| write_released(sink, jitter.finish()));

        // Unsubscribe even when writing failed
        if let Err(e) = self.send_control(ControlMessage::Stop).await {
            warn!("Failed to send 'STOP': {}", e);
        } else {
            info!("Sent 'STOP' to server {}", server);
        }
        flushed?;

        let counts = jitter.stats();
        stats.received = counts.received;
        stats.lost = counts.lost;
        stats.late = counts.late;
        stats.duplicate = counts.duplicate;
        stats.out_of_range = counts.out_of_range;
        stats.bytes_written = sink.bytes_written();

        Ok(stats)
    }

    async fn send_control(&self, message: ControlMessage) -> Result<()> {
        self.socket
            .send_to(message.as_bytes(), self.config.server)
            .await
            .map_err(Error::Io)?;
        Ok(())
    }
}

fn write_released<S: AudioSink>(sink: &mut S, released: Vec<Released>) -> Result<()> {
    for item in released {
        match item {
            Released::Packet(payload) => sink.write_pcm(&payload)?,
            Released::Silence => sink.write_pcm(&SILENCE)?,
        }
    }
    Ok(())
}
