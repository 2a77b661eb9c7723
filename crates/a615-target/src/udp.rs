//! Packet source for the well-known TFTP port.
//!
//! Reads datagrams with a bounded receive timeout and hands them to the
//! decoder through a bounded channel. The read path never waits on the
//! decoder: when the channel is full the datagram is dropped and counted.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::tftp::packet::MAX_PACKET_SIZE;

/// Datagram received on the well-known port.
#[derive(Debug, Clone)]
pub struct UdpPacket {
    pub payload: Bytes,
    pub source: SocketAddr,
    pub received_at: Instant,
}

#[derive(Debug, Default)]
pub struct ListenerStats {
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub errors: AtomicU64,
}

pub struct PacketSource {
    socket: UdpSocket,
    recv_timeout: Duration,
    stats: Arc<ListenerStats>,
}

impl PacketSource {
    pub async fn bind(addr: SocketAddr, recv_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("TFTP listener bound to {}", socket.local_addr()?);
        Ok(Self {
            socket,
            recv_timeout,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until cancelled or until the decoder goes away.
    pub async fn run(self, tx: mpsc::Sender<UdpPacket>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = tokio::time::timeout(self.recv_timeout, self.socket.recv_from(&mut buf)) => received,
            };

            let (size, source) = match received {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    error!("Error receiving TFTP packet: {}", e);
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                // Idle; loop to re-check cancellation.
                Err(_) => continue,
            };

            self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
            let packet = UdpPacket {
                payload: Bytes::copy_from_slice(&buf[..size]),
                source,
                received_at: Instant::now(),
            };

            match tx.try_send(packet) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(packet)) => {
                    warn!(
                        "Decoder queue full, packet lost ({} bytes from {})",
                        packet.payload.len(),
                        packet.source
                    );
                    self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Decoder queue closed, stopping listener");
                    break;
                }
            }
        }

        info!(
            "TFTP listener stopped: {} received, {} dropped",
            self.stats.packets_received.load(Ordering::Relaxed),
            self.stats.packets_dropped.load(Ordering::Relaxed)
        );
    }
}
