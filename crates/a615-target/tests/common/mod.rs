//! Fake ground support equipment: a minimal TFTP peer that serves loads on
//! its GET port and collects uploaded files on its PUT port.

#![allow(dead_code)]

use a615_codec::{LoadUploadRequest, LurFileEntry};
use a615_target::tftp::packet::{
    BLOCK_SIZE, ErrorCode, MAX_PACKET_SIZE, Packet, ack_packet, block_count, block_slice,
    data_packet, error_packet, wire_block,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub type TestResult<T = ()> = std::result::Result<T, Box<dyn std::error::Error>>;

pub const PART_NUMBER: &str = "EMB-HW-002-021-003";
pub const LOAD_PART_NUMBER: &str = "IMG-0001";
pub const WAIT: Duration = Duration::from_secs(5);

/// File received by the fake GSE.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub data: Vec<u8>,
    /// Every DATA payload seen, in arrival order, including unacknowledged ones
    pub packets: Vec<Vec<u8>>,
}

/// Packet loss the fake GSE simulates on each transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loss {
    None,
    /// Swallow the first ACK of a download or the first DATA of an upload
    /// without answering it.
    FirstReply,
}

#[derive(Clone)]
struct Peer {
    files: Arc<HashMap<String, Vec<u8>>>,
    loss: Loss,
    requested: mpsc::UnboundedSender<String>,
    uploads: mpsc::UnboundedSender<Upload>,
    acks: mpsc::UnboundedSender<u16>,
}

pub struct FakeGse {
    pub get_addr: SocketAddr,
    pub put_addr: SocketAddr,
    pub requested: mpsc::UnboundedReceiver<String>,
    pub uploads: mpsc::UnboundedReceiver<Upload>,
    /// Block numbers of every ACK received while serving downloads
    pub acks: mpsc::UnboundedReceiver<u16>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl FakeGse {
    pub async fn start(files: HashMap<String, Vec<u8>>) -> TestResult<Self> {
        Self::start_with_loss(files, Loss::None).await
    }

    pub async fn start_with_loss(files: HashMap<String, Vec<u8>>, loss: Loss) -> TestResult<Self> {
        let get_socket = UdpSocket::bind("127.0.0.1:0").await?;
        let put_socket = UdpSocket::bind("127.0.0.1:0").await?;
        let get_addr = get_socket.local_addr()?;
        let put_addr = put_socket.local_addr()?;
        let (requested_tx, requested) = mpsc::unbounded_channel();
        let (uploads_tx, uploads) = mpsc::unbounded_channel();
        let (acks_tx, acks) = mpsc::unbounded_channel();
        let peer = Peer {
            files: Arc::new(files),
            loss,
            requested: requested_tx,
            uploads: uploads_tx,
            acks: acks_tx,
        };

        let tasks = vec![
            tokio::spawn(serve(get_socket, peer.clone())),
            tokio::spawn(serve(put_socket, peer)),
        ];
        Ok(Self {
            get_addr,
            put_addr,
            requested,
            uploads,
            acks,
            tasks,
        })
    }

    pub async fn next_ack(&mut self) -> TestResult<u16> {
        tokio::time::timeout(WAIT, self.acks.recv())
            .await?
            .ok_or_else(|| "fake GSE stopped".into())
    }

    pub async fn next_upload(&mut self) -> TestResult<Upload> {
        tokio::time::timeout(WAIT, self.uploads.recv())
            .await?
            .ok_or_else(|| "fake GSE stopped".into())
    }

    pub async fn next_request(&mut self) -> TestResult<String> {
        tokio::time::timeout(WAIT, self.requested.recv())
            .await?
            .ok_or_else(|| "fake GSE stopped".into())
    }
}

impl Drop for FakeGse {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve(socket: UdpSocket, peer: Peer) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        match Packet::parse(&buf[..len]) {
            Ok(Packet::Rrq { filename, .. }) => {
                let _ = peer.requested.send(filename.clone());
                let file = peer.files.get(&filename).cloned();
                let peer = peer.clone();
                tokio::spawn(async move {
                    let _ = send_file(from, file, &peer).await;
                });
            }
            Ok(Packet::Wrq { filename, .. }) => {
                let peer = peer.clone();
                tokio::spawn(async move {
                    if let Ok((data, packets)) = receive_file(from, peer.loss).await {
                        let _ = peer.uploads.send(Upload {
                            filename,
                            data,
                            packets,
                        });
                    }
                });
            }
            _ => {}
        }
    }
}

async fn send_file(to: SocketAddr, file: Option<Vec<u8>>, peer: &Peer) -> TestResult {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(to).await?;
    let Some(data) = file else {
        socket
            .send(&error_packet(ErrorCode::FileNotFound, "file not found"))
            .await?;
        return Ok(());
    };

    let mut swallow_next = peer.loss == Loss::FirstReply;
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    for index in 1..=block_count(data.len()) {
        let block = wire_block(index);
        let packet = data_packet(block, block_slice(&data, index));
        socket.send(&packet).await?;
        loop {
            match tokio::time::timeout(Duration::from_millis(500), socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    if let Ok(Packet::Ack { block: acked }) = Packet::parse(&buf[..len]) {
                        let _ = peer.acks.send(acked);
                        if std::mem::take(&mut swallow_next) {
                            continue;
                        }
                        if acked == block {
                            break;
                        }
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    socket.send(&packet).await?;
                }
            }
        }
    }
    Ok(())
}

async fn receive_file(from: SocketAddr, loss: Loss) -> TestResult<(Vec<u8>, Vec<Vec<u8>>)> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(from).await?;
    socket.send(&ack_packet(0)).await?;

    let mut swallow_next = loss == Loss::FirstReply;
    let mut data = Vec::new();
    let mut packets = Vec::new();
    let mut expected = 1u16;
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let len = tokio::time::timeout(WAIT, socket.recv(&mut buf)).await??;
        if let Ok(Packet::Data { block, payload }) = Packet::parse(&buf[..len]) {
            packets.push(payload.to_vec());
            if std::mem::take(&mut swallow_next) {
                continue;
            }
            socket.send(&ack_packet(block)).await?;
            if block == expected {
                data.extend_from_slice(&payload);
                expected = expected.wrapping_add(1);
                if payload.len() < BLOCK_SIZE {
                    return Ok((data, packets));
                }
            }
        }
    }
}

/// The 40-byte single-file LUR a data loader sends to start a load.
pub fn sample_lur() -> TestResult<Vec<u8>> {
    let lur = LoadUploadRequest::new(vec![LurFileEntry {
        name: format!("{PART_NUMBER}.LUH"),
        part_number: LOAD_PART_NUMBER.to_string(),
    }])
    .encode()?;
    assert_eq!(lur.len(), 40);
    Ok(lur.to_vec())
}

pub fn temp_dir(label: &str) -> TestResult<PathBuf> {
    let dir = std::env::temp_dir().join(format!("a615_{}_{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Client side of a TFTP exchange with the target, driven packet by packet.
pub struct Loader {
    pub socket: UdpSocket,
    pub target: SocketAddr,
    pub session: Option<SocketAddr>,
}

impl Loader {
    pub async fn new(target: SocketAddr) -> TestResult<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
            target,
            session: None,
        })
    }

    pub async fn send_request(&self, packet: Packet) -> TestResult {
        self.socket.send_to(&packet.encode(), self.target).await?;
        Ok(())
    }

    /// Next packet from the target; latches the session port.
    pub async fn recv(&mut self) -> TestResult<Packet> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, from) = tokio::time::timeout(WAIT, self.socket.recv_from(&mut buf)).await??;
        self.session.get_or_insert(from);
        Ok(Packet::parse(&buf[..len])?)
    }

    pub async fn send_session(&self, bytes: &[u8]) -> TestResult {
        let session = self.session.ok_or("no session port yet")?;
        self.socket.send_to(bytes, session).await?;
        Ok(())
    }
}
