//! Events posted to the dispatcher and the bounded queue that carries them.

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;

use crate::error::{Result, TargetError};

/// Longest log message carried by an event.
pub const MAX_EVENT_MESSAGE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EnterMaintenanceRequest,
    AbortMaintenanceImmediate,
    WifiClientConnected,
    WifiClientDisconnected,
    LoadRequest,
    GseAuthSuccess,
    CommAuthFailure,
    CommTimeout,
    TransferComplete,
    SecImgHashOk,
    SecImgPnOk,
    SecImgFormatOk,
    SecErrImgHashMismatch,
    SecErrImgPnMismatch,
    SecErrImgBadFormat,
    ApStarted,
    ApStartFailure,
    ApInitFailed,
    SensorsLinkDown,
    GseProbeTimeout,
    LogInfo,
    CoreWarnUnexpectedEvent,
}

impl EventKind {
    pub const ALL: [EventKind; 22] = [
        EventKind::EnterMaintenanceRequest,
        EventKind::AbortMaintenanceImmediate,
        EventKind::WifiClientConnected,
        EventKind::WifiClientDisconnected,
        EventKind::LoadRequest,
        EventKind::GseAuthSuccess,
        EventKind::CommAuthFailure,
        EventKind::CommTimeout,
        EventKind::TransferComplete,
        EventKind::SecImgHashOk,
        EventKind::SecImgPnOk,
        EventKind::SecImgFormatOk,
        EventKind::SecErrImgHashMismatch,
        EventKind::SecErrImgPnMismatch,
        EventKind::SecErrImgBadFormat,
        EventKind::ApStarted,
        EventKind::ApStartFailure,
        EventKind::ApInitFailed,
        EventKind::SensorsLinkDown,
        EventKind::GseProbeTimeout,
        EventKind::LogInfo,
        EventKind::CoreWarnUnexpectedEvent,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub message: String,
    /// Downloaded load, set on `TransferComplete`
    pub image: Option<PathBuf>,
}

impl Event {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_EVENT_MESSAGE_LEN {
            let mut end = MAX_EVENT_MESSAGE_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Self {
            kind,
            message,
            image: None,
        }
    }

    pub fn transfer_complete(image: PathBuf) -> Self {
        let message = format!("load stored at {}", image.display());
        Self {
            image: Some(image),
            ..Self::new(EventKind::TransferComplete, message)
        }
    }
}

impl From<EventKind> for Event {
    fn from(kind: EventKind) -> Self {
        Self::new(kind, "")
    }
}

/// Producer side of the event queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    post_timeout: Option<Duration>,
}

impl EventSender {
    /// Waits up to the post timeout for room in the queue. On failure the
    /// event is dropped and the error logged.
    pub async fn post(&self, event: impl Into<Event>) -> Result<()> {
        let event = event.into();
        let kind = event.kind;
        let outcome = match self.post_timeout {
            Some(limit) => self
                .tx
                .send_timeout(event, limit)
                .await
                .map_err(|e| match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => {
                        format!("queue full after {:?}", limit)
                    }
                    mpsc::error::SendTimeoutError::Closed(_) => "dispatcher stopped".to_string(),
                }),
            None => self
                .tx
                .send(event)
                .await
                .map_err(|_| "dispatcher stopped".to_string()),
        };
        outcome.map_err(|reason| {
            error!("Dropping {:?} event: {}", kind, reason);
            TargetError::EventQueue(reason)
        })
    }

    /// Enqueues without waiting.
    pub fn try_post(&self, event: impl Into<Event>) -> Result<()> {
        let event = event.into();
        let kind = event.kind;
        self.tx.try_send(event).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "dispatcher stopped",
            };
            error!("Dropping {:?} event: {}", kind, reason);
            TargetError::EventQueue(reason.to_string())
        })
    }
}

pub type EventReceiver = mpsc::Receiver<Event>;

/// Creates the event queue. A zero capacity is the one unrecoverable setup
/// error.
pub fn event_channel(
    capacity: usize,
    post_timeout: Option<Duration>,
) -> Result<(EventSender, EventReceiver)> {
    if capacity == 0 {
        return Err(TargetError::EventQueue(
            "event queue capacity must be at least 1".to_string(),
        ));
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((EventSender { tx, post_timeout }, rx))
}
