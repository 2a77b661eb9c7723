//! Per-transfer session workers spawned by the decoder.
//!
//! Each worker owns an ephemeral socket connected to the requesting client.
//! A WRQ carries an LUR into the accumulation buffer and, once complete,
//! triggers the download of the listed load. An RRQ is answered with an LUI.

use a615_codec::{
    ArincError, ArincStatusCode, BufferClaim, LurFileEntry, ProgressRatio, RecordKind,
    classify_filename, parse_lur, serialize_lui,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::client::{TftpClient, bind_ephemeral};
use super::packet::{
    BLOCK_SIZE, ErrorCode, MAX_PACKET_SIZE, Opcode, Packet, ack_packet, block_count, block_slice,
    data_packet, error_packet, wire_block,
};
use crate::audit::AuditLogger;
use crate::error::{Result, TargetError};
use crate::event::{Event, EventKind, EventSender};
use crate::lus::{LusHandle, LusRequest};

/// Retransmissions allowed per block or ACK before a session gives up.
pub const SESSION_RETRY_LIMIT: u32 = 1;

/// Request handed from the decoder to a session worker.
#[derive(Debug)]
pub struct SessionConfig {
    pub opcode: Opcode,
    pub filename: String,
    pub client: SocketAddr,
    /// Exclusive use of the accumulation buffer, held by WRQ sessions
    pub write_claim: Option<BufferClaim>,
    pub correlation_id: String,
}

/// Everything sessions of one maintenance stack share.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub part_number: String,
    pub root_dir: PathBuf,
    pub gse_get_addr: SocketAddr,
    pub recv_timeout: Duration,
    pub client: TftpClient,
    pub events: EventSender,
    pub lus: LusHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataAction {
    /// Block stored; acknowledge it. `last` ends the transfer.
    Ack { block: u16, last: bool },
    /// Repeat of an already accepted block; acknowledge it again
    Reack { block: u16 },
    /// Out of sequence; no append, no ACK
    Ignore { expected: u16 },
    /// Accumulation buffer cannot hold the block
    BufferFull(ArincError),
}

/// Receive side of a WRQ: decides what each DATA block does to the buffer.
#[derive(Debug, Default)]
pub struct WriteTransfer {
    last_block: u16,
    blocks: u64,
    bytes: u64,
}

impl WriteTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected_block(&self) -> u16 {
        self.last_block.wrapping_add(1)
    }

    /// Block number of the most recent ACK sent (0 after the WRQ).
    pub fn last_ack(&self) -> u16 {
        self.last_block
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// True for a block at or behind the last accepted one, counting
    /// across the 65535 wrap.
    fn already_accepted(&self, block: u16) -> bool {
        let behind = self.last_block.wrapping_sub(block);
        self.blocks > 0 && behind < 0x8000 && u64::from(behind) < self.blocks
    }

    pub fn on_data(&mut self, block: u16, payload: &[u8], claim: &BufferClaim) -> DataAction {
        if block == self.expected_block() {
            if let Err(e) = claim.append(payload) {
                return DataAction::BufferFull(e);
            }
            self.last_block = block;
            self.blocks += 1;
            self.bytes += payload.len() as u64;
            DataAction::Ack {
                block,
                last: payload.len() < BLOCK_SIZE,
            }
        } else if self.already_accepted(block) {
            DataAction::Reack { block }
        } else {
            DataAction::Ignore {
                expected: self.expected_block(),
            }
        }
    }
}

/// Runs one session to completion; failures are logged, never propagated.
pub async fn run_session(config: SessionConfig, ctx: Arc<SessionContext>) {
    let client = config.client;
    let filename = config.filename.clone();
    let opcode = config.opcode;
    let result = match opcode {
        Opcode::Wrq => handle_write(config, &ctx).await,
        Opcode::Rrq => handle_read(config, &ctx).await,
        other => Err(TargetError::Tftp(format!(
            "no session for {:?} requests",
            other
        ))),
    };
    if let Err(e) = result {
        warn!("Session for {} ({}) ended: {}", filename, client, e);
    }
}

async fn session_socket(client: SocketAddr) -> Result<UdpSocket> {
    let socket = bind_ephemeral(client).await?;
    socket.connect(client).await?;
    debug!(
        "Session socket {} connected to {}",
        socket.local_addr()?,
        client
    );
    Ok(socket)
}

async fn handle_write(mut config: SessionConfig, ctx: &SessionContext) -> Result<()> {
    let claim = config
        .write_claim
        .take()
        .ok_or_else(|| TargetError::Tftp("write session without buffer claim".to_string()))?;
    let client = config.client;
    let corr = Some(config.correlation_id.as_str());
    AuditLogger::write_request(client, &config.filename, corr);

    let start = Instant::now();
    let socket = session_socket(client).await?;
    socket.send(&ack_packet(0)).await?;

    let mut transfer = WriteTransfer::new();
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut retries = 0u32;

    loop {
        let len = match timeout(ctx.recv_timeout, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                AuditLogger::write_failed(client, &config.filename, &e.to_string(), transfer.blocks(), corr);
                return Err(TargetError::Io(e));
            }
            Err(_) => {
                if retries >= SESSION_RETRY_LIMIT {
                    let reason = format!("no DATA {} from {}", transfer.expected_block(), client);
                    AuditLogger::write_failed(client, &config.filename, &reason, transfer.blocks(), corr);
                    return Err(TargetError::SessionTimeout(reason));
                }
                retries += 1;
                warn!(
                    "Timeout waiting for DATA {} from {}, re-sending ACK {}",
                    transfer.expected_block(),
                    client,
                    transfer.last_ack()
                );
                socket.send(&ack_packet(transfer.last_ack())).await?;
                continue;
            }
        };

        match Packet::parse(&buf[..len]) {
            Ok(Packet::Data { block, payload }) => match transfer.on_data(block, &payload, &claim) {
                DataAction::Ack { block, last } => {
                    retries = 0;
                    socket.send(&ack_packet(block)).await?;
                    if last {
                        break;
                    }
                }
                DataAction::Reack { block } => {
                    debug!("Duplicate DATA {} from {}, re-sending ACK", block, client);
                    socket.send(&ack_packet(block)).await?;
                }
                DataAction::Ignore { expected } => {
                    debug!(
                        "Ignoring DATA {} from {} (expecting {})",
                        block, client, expected
                    );
                }
                DataAction::BufferFull(e) => {
                    socket
                        .send(&error_packet(ErrorCode::DiskFull, "buffer full"))
                        .await?;
                    AuditLogger::write_failed(client, &config.filename, &e.to_string(), transfer.blocks(), corr);
                    return Err(e.into());
                }
            },
            Ok(Packet::Error { code, message }) => {
                AuditLogger::write_failed(client, &config.filename, &message, transfer.blocks(), corr);
                return Err(TargetError::Remote { code, message });
            }
            Ok(other) => {
                warn!("Unexpected {:?} from {} during write", other.opcode(), client);
            }
            Err(e) => {
                warn!("Malformed packet from {}: {}", client, e);
            }
        }
    }

    let payload = claim.snapshot();
    drop(claim);
    drop(socket);

    AuditLogger::write_completed(
        client,
        &config.filename,
        transfer.bytes(),
        transfer.blocks(),
        start.elapsed().as_millis() as u64,
        corr,
    );
    info!(
        "Received {} from {}: {} bytes in {} blocks",
        config.filename,
        client,
        transfer.bytes(),
        transfer.blocks()
    );

    process_load_request(&config, payload, ctx).await
}

/// Acts on a completed LUR upload: announce it, then fetch the first load
/// it names.
async fn process_load_request(
    config: &SessionConfig,
    payload: Bytes,
    ctx: &SessionContext,
) -> Result<()> {
    let corr = Some(config.correlation_id.as_str());
    match classify_filename(&config.filename, &ctx.part_number) {
        Ok(RecordKind::Lur) => {}
        Ok(kind) => {
            let reason = format!("{} records are not accepted for writing", kind.extension());
            warn!("Refusing {}: {}", config.filename, reason);
            AuditLogger::write_request_denied(config.client, &config.filename, &reason, corr);
            return Ok(());
        }
        Err(e) => {
            warn!("Refusing {}: {}", config.filename, e);
            AuditLogger::write_request_denied(config.client, &config.filename, &e.to_string(), corr);
            return Ok(());
        }
    }

    if let Err(e) = ctx
        .events
        .post(Event::new(EventKind::LoadRequest, config.filename.as_str()))
        .await
    {
        error!("Load request from {} not announced: {}", config.client, e);
    }

    let request = match parse_lur(&payload) {
        Ok(request) => request,
        Err(e) => {
            AuditLogger::protocol_violation(config.client, &format!("invalid LUR: {e}"));
            ctx.lus
                .submit(LusRequest::new(ArincStatusCode::AbortedByTarget, "invalid load request"));
            abandon_load(ctx, format!("invalid load request {}: {}", config.filename, e)).await;
            return Err(e.into());
        }
    };
    let Some(entry) = request.primary() else {
        info!("{} lists no files, nothing to load", config.filename);
        abandon_load(ctx, format!("{} lists no files", config.filename)).await;
        return Ok(());
    };
    if request.files.len() > 1 {
        info!(
            "{} lists {} files, loading {} only",
            config.filename,
            request.files.len(),
            entry.part_number
        );
    }

    download_load(entry, ctx, corr).await
}

/// Returns the connection to waiting for a request after a load request
/// that will not produce a transfer.
async fn abandon_load(ctx: &SessionContext, reason: String) {
    if let Err(e) = ctx.events.post(Event::new(EventKind::CommTimeout, reason)).await {
        error!("Abandoned load not announced: {}", e);
    }
}

async fn download_load(entry: &LurFileEntry, ctx: &SessionContext, corr: Option<&str>) -> Result<()> {
    let local = match load_path(&ctx.root_dir, &entry.part_number) {
        Ok(local) => local,
        Err(e) => {
            warn!("Refusing load {:?}: {}", entry.part_number, e);
            ctx.lus.submit(
                LusRequest::new(ArincStatusCode::AbortedByTarget, "invalid part number")
                    .with_file(entry, ProgressRatio::ZERO),
            );
            abandon_load(ctx, e.to_string()).await;
            return Err(e);
        }
    };

    ctx.lus.submit(
        LusRequest::new(ArincStatusCode::InProgress, "load in progress")
            .with_file(entry, ProgressRatio::ZERO),
    );

    match ctx
        .client
        .get(ctx.gse_get_addr, &entry.part_number, &local)
        .await
    {
        Ok(summary) => {
            AuditLogger::download_completed(
                ctx.gse_get_addr,
                &entry.part_number,
                summary.bytes,
                summary.duration.as_millis() as u64,
                corr,
            );
            ctx.lus.submit(
                LusRequest::new(ArincStatusCode::CompletedWithoutError, "load complete")
                    .with_file(entry, ProgressRatio::COMPLETE),
            );
            ctx.events.post(Event::transfer_complete(local)).await
        }
        Err(e) => {
            AuditLogger::download_failed(ctx.gse_get_addr, &entry.part_number, &e.to_string(), corr);
            ctx.lus.submit(
                LusRequest::new(ArincStatusCode::AbortedByTarget, "load aborted")
                    .with_file(entry, ProgressRatio::ZERO),
            );
            abandon_load(ctx, format!("download of {} failed: {}", entry.part_number, e)).await;
            Err(e)
        }
    }
}

/// Local path for a downloaded load. The part number becomes the file name
/// and may not name a directory.
pub fn load_path(root_dir: &Path, part_number: &str) -> Result<PathBuf> {
    let name = Path::new(part_number);
    if part_number.is_empty()
        || part_number.contains('\0')
        || name.file_name() != Some(name.as_os_str())
    {
        return Err(TargetError::Arinc(ArincError::InvalidArgument(format!(
            "part number '{part_number}' is not a file name"
        ))));
    }
    Ok(root_dir.join(name))
}

async fn handle_read(config: SessionConfig, ctx: &SessionContext) -> Result<()> {
    let (status, description) = match classify_filename(&config.filename, &ctx.part_number) {
        Ok(RecordKind::Lui) => (ArincStatusCode::Accepted, None),
        Err(ArincError::UnauthorizedDevice(_)) => {
            (ArincStatusCode::NotAccepted, Some("invalid file name"))
        }
        _ => (ArincStatusCode::NotSupported, Some("unsupported file type")),
    };
    debug!(
        "Answering RRQ {} from {} with {:?}",
        config.filename, config.client, status
    );

    let lui = serialize_lui(status, description)?;
    let socket = session_socket(config.client).await?;
    send_blocks(&socket, &lui, ctx.recv_timeout).await?;

    AuditLogger::initialization_served(
        config.client,
        &config.filename,
        &format!("{:?}", status),
        Some(config.correlation_id.as_str()),
    );
    Ok(())
}

/// Sends `payload` in DATA blocks, advancing only on the matching ACK.
async fn send_blocks(socket: &UdpSocket, payload: &[u8], recv_timeout: Duration) -> Result<()> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    for index in 1..=block_count(payload.len()) {
        let block = wire_block(index);
        let packet = data_packet(block, block_slice(payload, index));
        socket.send(&packet).await?;
        let mut retries = 0u32;

        loop {
            let reply = match timeout(recv_timeout, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => Some(Packet::parse(&buf[..len])),
                Ok(Err(e)) => return Err(TargetError::Io(e)),
                Err(_) => None,
            };

            match reply {
                Some(Ok(Packet::Ack { block: acked })) if acked == block => break,
                Some(Ok(Packet::Error { code, message })) => {
                    return Err(TargetError::Remote { code, message });
                }
                Some(Ok(Packet::Ack { .. })) | Some(Err(_)) | None => {
                    if retries >= SESSION_RETRY_LIMIT {
                        return Err(TargetError::SessionTimeout(format!(
                            "no ACK {} after {} retransmission",
                            block, SESSION_RETRY_LIMIT
                        )));
                    }
                    retries += 1;
                    warn!("No valid ACK {}, retransmitting", block);
                    socket.send(&packet).await?;
                }
                Some(Ok(other)) => {
                    socket
                        .send(&error_packet(ErrorCode::IllegalOperation, "invalid package"))
                        .await?;
                    return Err(TargetError::Tftp(format!(
                        "unexpected {:?} while sending",
                        other.opcode()
                    )));
                }
            }
        }
    }
    Ok(())
}
