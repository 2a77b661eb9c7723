//! Load Upload Status reporting.
//!
//! Session workers queue status requests with `LusHandle::submit`, which
//! never waits; a single task turns each request into an LUS record and PUTs
//! it to the data loader.

use a615_codec::{
    ArincStatusCode, LurFileEntry, LusFileStatus, ProgressRatio, RecordKind, serialize_lus,
};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::tftp::TftpClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LusRequest {
    pub status: ArincStatusCode,
    pub description: String,
    pub files: Vec<LusFileStatus>,
}

impl LusRequest {
    pub fn new(status: ArincStatusCode, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
            files: Vec::new(),
        }
    }

    /// Adds the status of one load file, reported with the overall status.
    pub fn with_file(mut self, entry: &LurFileEntry, ratio: ProgressRatio) -> Self {
        self.files.push(LusFileStatus {
            name: entry.name.clone(),
            part_number: entry.part_number.clone(),
            ratio,
            status: self.status,
            description: self.description.clone(),
        });
        self
    }
}

/// Producer side of the status queue.
#[derive(Debug, Clone)]
pub struct LusHandle {
    tx: mpsc::Sender<LusRequest>,
}

impl LusHandle {
    /// Queues `request` without waiting. Returns false when it was dropped.
    pub fn submit(&self, request: LusRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!("Status queue full, dropping {:?} report", request.status);
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                debug!("Status sender stopped, dropping {:?} report", request.status);
                false
            }
        }
    }
}

pub fn lus_channel(capacity: usize) -> (LusHandle, mpsc::Receiver<LusRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (LusHandle { tx }, rx)
}

/// Uploads status records as `<part number>.LUS`.
pub struct LusSender {
    client: TftpClient,
    server: SocketAddr,
    filename: String,
    counter: u16,
}

impl LusSender {
    pub fn new(client: TftpClient, server: SocketAddr, part_number: &str) -> Self {
        Self {
            client,
            server,
            filename: RecordKind::Lus.file_name(part_number),
            counter: 0,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<LusRequest>, shutdown: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.send(request) => {}
            }
        }
        debug!("Status sender stopped after {} reports", self.counter);
    }

    async fn send(&mut self, request: LusRequest) {
        self.counter = self.counter.wrapping_add(1);
        let record = match serialize_lus(
            request.status,
            &request.description,
            self.counter,
            0,
            &request.files,
        ) {
            Ok(record) => record,
            Err(e) => {
                warn!("Could not build status record: {}", e);
                AuditLogger::status_upload_failed(self.server, &self.filename, &e.to_string());
                return;
            }
        };

        let status = format!("{:?}", request.status);
        match self.client.put(self.server, &self.filename, &record).await {
            Ok(_) if request.status.is_failure() => {
                warn!("Reported {} to {}", status, self.server);
                AuditLogger::status_uploaded(self.server, &self.filename, &status);
            }
            Ok(_) => {
                info!("Reported {} to {}", status, self.server);
                AuditLogger::status_uploaded(self.server, &self.filename, &status);
            }
            Err(e) => {
                warn!("Status upload to {} failed: {}", self.server, e);
                AuditLogger::status_upload_failed(self.server, &self.filename, &e.to_string());
            }
        }
    }
}
