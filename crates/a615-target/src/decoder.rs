//! Opcode decoder for datagrams arriving on the well-known port.
//!
//! Only RRQ and WRQ start sessions there; everything else belongs on a
//! session's own port and is dropped.

use a615_codec::AccumulationBuffer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::tftp::client::bind_ephemeral;
use crate::tftp::packet::{ErrorCode, OCTET_MODE, Opcode, Packet, error_packet};
use crate::tftp::session::{SessionConfig, SessionContext, run_session};
use crate::udp::UdpPacket;

/// Longest file name accepted in a request.
pub const MAX_FILENAME_LEN: usize = 128;

pub struct Decoder {
    ctx: Arc<SessionContext>,
    buffer: Arc<AccumulationBuffer>,
}

impl Decoder {
    pub fn new(ctx: Arc<SessionContext>, buffer: Arc<AccumulationBuffer>) -> Self {
        Self { ctx, buffer }
    }

    /// Runs until cancelled or until the packet source goes away. Live
    /// sessions are aborted on exit.
    pub async fn run(self, mut rx: mpsc::Receiver<UdpPacket>, shutdown: CancellationToken) {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Session task failed: {}", e);
                    }
                }
                packet = rx.recv() => match packet {
                    Some(packet) => self.dispatch(packet, &mut sessions).await,
                    None => break,
                },
            }
        }

        if !sessions.is_empty() {
            info!("Aborting {} active session(s)", sessions.len());
        }
        sessions.shutdown().await;
        debug!("Decoder stopped");
    }

    async fn dispatch(&self, packet: UdpPacket, sessions: &mut JoinSet<()>) {
        let source = packet.source;
        if packet.payload.len() < 2 {
            warn!("Dropping {}-byte datagram from {}", packet.payload.len(), source);
            return;
        }

        let opcode = u16::from_be_bytes([packet.payload[0], packet.payload[1]]);
        match Opcode::try_from(opcode) {
            Ok(Opcode::Rrq | Opcode::Wrq) => {}
            Ok(other) => {
                warn!("Dropping {:?} from {} on the well-known port", other, source);
                return;
            }
            Err(_) => {
                warn!("Dropping packet with unknown opcode {} from {}", opcode, source);
                return;
            }
        }

        let (opcode, filename, mode) = match Packet::parse(&packet.payload) {
            Ok(Packet::Rrq { filename, mode }) => (Opcode::Rrq, filename, mode),
            Ok(Packet::Wrq { filename, mode }) => (Opcode::Wrq, filename, mode),
            Ok(other) => {
                warn!("Dropping {:?} from {}", other.opcode(), source);
                return;
            }
            Err(e) => {
                AuditLogger::protocol_violation(source, &e.to_string());
                reject(source, ErrorCode::IllegalOperation, "malformed request").await;
                return;
            }
        };

        if filename.len() > MAX_FILENAME_LEN {
            AuditLogger::protocol_violation(
                source,
                &format!("file name of {} bytes", filename.len()),
            );
            reject(source, ErrorCode::IllegalOperation, "file name too long").await;
            return;
        }
        if !mode.eq_ignore_ascii_case(OCTET_MODE) {
            AuditLogger::protocol_violation(source, &format!("unsupported mode '{mode}'"));
            reject(source, ErrorCode::IllegalOperation, "only octet mode is supported").await;
            return;
        }

        let correlation_id = AuditLogger::new_correlation_id();
        let write_claim = if opcode == Opcode::Wrq {
            match self.buffer.try_claim() {
                Some(claim) => Some(claim),
                None => {
                    AuditLogger::write_request_denied(
                        source,
                        &filename,
                        "write session already in progress",
                        Some(&correlation_id),
                    );
                    reject(source, ErrorCode::NotDefined, "write session already in progress")
                        .await;
                    return;
                }
            }
        } else {
            None
        };

        debug!(
            "{:?} {} from {} after {:?} queued",
            opcode,
            filename,
            source,
            packet.received_at.elapsed()
        );
        let config = SessionConfig {
            opcode,
            filename,
            client: source,
            write_claim,
            correlation_id,
        };
        sessions.spawn(run_session(config, Arc::clone(&self.ctx)));
    }
}

/// Answers a refused request with an ERROR from a throwaway socket.
async fn reject(client: SocketAddr, code: ErrorCode, message: &str) {
    warn!("Rejecting request from {}: {}", client, message);
    let sent = async {
        let socket = bind_ephemeral(client).await?;
        socket.send_to(&error_packet(code, message), client).await?;
        Ok::<_, crate::error::TargetError>(())
    };
    if let Err(e) = sent.await {
        debug!("Could not send error to {}: {}", client, e);
    }
}
