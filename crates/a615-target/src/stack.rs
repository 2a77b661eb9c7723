//! Maintenance network stack: the packet source, the decoder and the LUS
//! sender, started together when maintenance begins and stopped together
//! when it ends.

use a615_codec::AccumulationBuffer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TargetConfig;
use crate::decoder::Decoder;
use crate::error::Result;
use crate::event::EventSender;
use crate::lus::{LusSender, lus_channel};
use crate::tftp::TftpClient;
use crate::tftp::session::SessionContext;
use crate::udp::PacketSource;

/// Settings the stack needs, taken from the target configuration.
#[derive(Debug, Clone)]
pub struct StackSettings {
    pub bind_addr: SocketAddr,
    pub part_number: String,
    pub root_dir: PathBuf,
    pub gse_get_addr: SocketAddr,
    pub gse_put_addr: SocketAddr,
    pub listener_recv: Duration,
    pub session_recv: Duration,
    pub client_recv: Duration,
    pub packet_queue: usize,
    pub lus_queue: usize,
}

impl From<&TargetConfig> for StackSettings {
    fn from(config: &TargetConfig) -> Self {
        Self {
            bind_addr: config.bind_addr,
            part_number: config.device.part_number.clone(),
            root_dir: config.root_dir.clone(),
            gse_get_addr: config.gse.get_addr,
            gse_put_addr: config.gse.put_addr,
            listener_recv: config.timeouts.listener_recv(),
            session_recv: config.timeouts.session_recv(),
            client_recv: config.timeouts.client_recv(),
            packet_queue: config.queues.packets,
            lus_queue: config.queues.lus,
        }
    }
}

pub struct MaintenanceStack {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceStack {
    /// Binds the well-known port and spawns the stack's tasks under a child
    /// of `parent`.
    pub async fn start(
        settings: &StackSettings,
        buffer: Arc<AccumulationBuffer>,
        events: EventSender,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let source = PacketSource::bind(settings.bind_addr, settings.listener_recv).await?;
        let local_addr = source.local_addr()?;
        let shutdown = parent.child_token();

        let client = TftpClient::new(settings.client_recv);
        let (lus, lus_rx) = lus_channel(settings.lus_queue);
        let lus_sender = LusSender::new(client.clone(), settings.gse_put_addr, &settings.part_number);

        let ctx = Arc::new(SessionContext {
            part_number: settings.part_number.clone(),
            root_dir: settings.root_dir.clone(),
            gse_get_addr: settings.gse_get_addr,
            recv_timeout: settings.session_recv,
            client,
            events,
            lus,
        });
        let (packet_tx, packet_rx) = mpsc::channel(settings.packet_queue.max(1));
        let decoder = Decoder::new(ctx, buffer);

        let tasks = vec![
            tokio::spawn(source.run(packet_tx, shutdown.clone())),
            tokio::spawn(decoder.run(packet_rx, shutdown.clone())),
            tokio::spawn(lus_sender.run(lus_rx, shutdown.clone())),
        ];
        info!("Maintenance stack listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shutdown,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// False once any of the stack's tasks has exited.
    pub fn is_healthy(&self) -> bool {
        !self.shutdown.is_cancelled() && self.tasks.iter().all(|task| !task.is_finished())
    }

    /// Cancels the tasks and waits up to `grace` for them; stragglers are
    /// aborted.
    pub async fn stop(self, grace: Duration) {
        self.shutdown.cancel();
        for task in self.tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!("Maintenance task failed: {}", e),
                Err(_) => {
                    warn!("Maintenance task did not stop within {:?}, aborting", grace);
                    abort.abort();
                }
            }
        }
        info!("Maintenance stack on {} stopped", self.local_addr);
    }
}
