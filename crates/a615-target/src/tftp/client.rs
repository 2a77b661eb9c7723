//! Active-role TFTP client: fetches load files from the data loader and
//! uploads status files to it.

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::packet::{
    BLOCK_SIZE, MAX_PACKET_SIZE, OCTET_MODE, Packet, ack_packet, block_count, block_slice,
    data_packet, wire_block,
};
use crate::error::{Result, TargetError};

/// Consecutive timeouts tolerated before a transfer is abandoned.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes: u64,
    pub blocks: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct TftpClient {
    recv_timeout: Duration,
    max_retries: u32,
}

impl TftpClient {
    pub fn new(recv_timeout: Duration) -> Self {
        Self {
            recv_timeout,
            max_retries: MAX_RETRIES,
        }
    }

    /// Download `remote_file` from `server` into `local_file` (RRQ).
    ///
    /// A partially written file is removed when the transfer fails.
    pub async fn get(
        &self,
        server: SocketAddr,
        remote_file: &str,
        local_file: &Path,
    ) -> Result<TransferSummary> {
        let socket = bind_ephemeral(server).await?;
        let request = Packet::Rrq {
            filename: remote_file.to_string(),
            mode: OCTET_MODE.to_string(),
        }
        .encode();
        socket.send_to(&request, server).await?;
        debug!("Sent RRQ for {} to {}", remote_file, server);

        let mut file = File::create(local_file).await?;
        let result = self
            .receive_blocks(&socket, server, &request, &mut file)
            .await;
        match result {
            Ok(summary) => {
                file.sync_all().await?;
                info!(
                    "Downloaded {} from {}: {} bytes in {:.2}s",
                    remote_file,
                    server,
                    summary.bytes,
                    summary.duration.as_secs_f64()
                );
                Ok(summary)
            }
            Err(e) => {
                drop(file);
                if let Err(remove_err) = tokio::fs::remove_file(local_file).await {
                    debug!(
                        "Could not remove partial file {}: {}",
                        local_file.display(),
                        remove_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn receive_blocks(
        &self,
        socket: &UdpSocket,
        server: SocketAddr,
        request: &[u8],
        file: &mut File,
    ) -> Result<TransferSummary> {
        let start = Instant::now();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut expected_block = 1u16;
        let mut blocks = 0u64;
        let mut bytes = 0u64;
        let mut retries = 0u32;
        // Server TID, latched from its first reply
        let mut server_tid: Option<SocketAddr> = None;

        loop {
            let (len, from) = match timeout(self.recv_timeout, socket.recv_from(&mut buf)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => return Err(TargetError::Io(e)),
                Err(_) => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Err(TargetError::SessionTimeout(format!(
                            "no DATA {} from {} after {} retries",
                            expected_block, server, self.max_retries
                        )));
                    }
                    warn!(
                        "Timeout waiting for DATA {}, retrying ({}/{})",
                        expected_block, retries, self.max_retries
                    );
                    match server_tid {
                        Some(tid) if blocks > 0 => {
                            socket
                                .send_to(&ack_packet(expected_block.wrapping_sub(1)), tid)
                                .await?;
                        }
                        _ => {
                            socket.send_to(request, server).await?;
                        }
                    }
                    continue;
                }
            };

            match server_tid {
                None => {
                    server_tid = Some(from);
                    debug!("Server TID: {}", from);
                }
                Some(tid) if tid != from => {
                    warn!("Ignoring packet from unexpected source: {}", from);
                    continue;
                }
                Some(_) => {}
            }

            let packet = match Packet::parse(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Ignoring malformed packet from {}: {}", from, e);
                    continue;
                }
            };

            match packet {
                Packet::Data { block, payload } if block == expected_block => {
                    file.write_all(&payload).await?;
                    socket.send_to(&ack_packet(block), from).await?;
                    blocks += 1;
                    bytes += payload.len() as u64;
                    retries = 0;
                    expected_block = expected_block.wrapping_add(1);

                    if payload.len() < BLOCK_SIZE {
                        file.flush().await?;
                        return Ok(TransferSummary {
                            bytes,
                            blocks,
                            duration: start.elapsed(),
                        });
                    }
                }
                Packet::Data { block, .. }
                    if blocks > 0 && block == expected_block.wrapping_sub(1) =>
                {
                    debug!("Duplicate DATA {}, re-sending ACK", block);
                    socket.send_to(&ack_packet(block), from).await?;
                }
                Packet::Data { block, .. } => {
                    debug!("Ignoring DATA {} (expecting {})", block, expected_block);
                }
                Packet::Error { code, message } => {
                    return Err(TargetError::Remote { code, message });
                }
                other => {
                    warn!("Unexpected {:?} during download", other.opcode());
                }
            }
        }
    }

    /// Upload `payload` to `server` as `remote_file` (WRQ).
    pub async fn put(
        &self,
        server: SocketAddr,
        remote_file: &str,
        payload: &[u8],
    ) -> Result<TransferSummary> {
        let start = Instant::now();
        let socket = bind_ephemeral(server).await?;
        let request = Packet::Wrq {
            filename: remote_file.to_string(),
            mode: OCTET_MODE.to_string(),
        }
        .encode();
        socket.send_to(&request, server).await?;
        debug!("Sent WRQ for {} to {}", remote_file, server);

        let total_blocks = block_count(payload.len());
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        // Block awaiting acknowledgement; 0 is the WRQ itself
        let mut current = 0usize;
        let mut retries = 0u32;
        let mut session_tid: Option<SocketAddr> = None;

        loop {
            let (len, from) = match timeout(self.recv_timeout, socket.recv_from(&mut buf)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => return Err(TargetError::Io(e)),
                Err(_) => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Err(TargetError::SessionTimeout(format!(
                            "no ACK {} from {} after {} retries",
                            current, server, self.max_retries
                        )));
                    }
                    warn!(
                        "Timeout waiting for ACK {}, retrying ({}/{})",
                        current, retries, self.max_retries
                    );
                    match session_tid {
                        Some(tid) if current > 0 => {
                            let block = block_slice(payload, current);
                            socket
                                .send_to(&data_packet(wire_block(current), block), tid)
                                .await?;
                        }
                        _ => {
                            socket.send_to(&request, server).await?;
                        }
                    }
                    continue;
                }
            };

            match session_tid {
                None => {
                    session_tid = Some(from);
                    debug!("Session TID: {}", from);
                }
                Some(tid) if tid != from => {
                    warn!("Ignoring packet from unexpected source: {}", from);
                    continue;
                }
                Some(_) => {}
            }

            match Packet::parse(&buf[..len]) {
                Ok(Packet::Ack { block }) if block == wire_block(current) => {
                    retries = 0;
                    if current == total_blocks {
                        info!(
                            "Uploaded {} to {}: {} bytes",
                            remote_file,
                            server,
                            payload.len()
                        );
                        return Ok(TransferSummary {
                            bytes: payload.len() as u64,
                            blocks: total_blocks as u64,
                            duration: start.elapsed(),
                        });
                    }
                    current += 1;
                    let block = block_slice(payload, current);
                    socket
                        .send_to(&data_packet(wire_block(current), block), from)
                        .await?;
                }
                Ok(Packet::Ack { block }) => {
                    debug!("Ignoring ACK {} (waiting for {})", block, current);
                }
                Ok(Packet::Error { code, message }) => {
                    return Err(TargetError::Remote { code, message });
                }
                Ok(other) => {
                    warn!("Unexpected {:?} during upload", other.opcode());
                }
                Err(e) => {
                    warn!("Ignoring malformed packet from {}: {}", from, e);
                }
            }
        }
    }
}

/// Binds an ephemeral socket in the address family of `peer`.
pub(crate) async fn bind_ephemeral(peer: SocketAddr) -> Result<UdpSocket> {
    let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    Ok(UdpSocket::bind(local).await?)
}
