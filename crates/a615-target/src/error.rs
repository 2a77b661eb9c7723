use a615_codec::ArincError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("Peer sent error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ARINC record error: {0}")]
    Arinc(#[from] ArincError),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Session timed out: {0}")]
    SessionTimeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Event queue error: {0}")]
    EventQueue(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TargetError {
    /// True when the failure came from an exhausted retry budget.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TargetError::SessionTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, TargetError>;
