use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArincError {
    #[error("Record exceeds capacity: needs {needed} bytes, capacity is {capacity}")]
    NoMem { needed: usize, capacity: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Malformed record at offset {offset}: {reason}")]
    MalformedPacket { offset: usize, reason: String },

    #[error("Files list too large: {count} entries, at most {max} allowed")]
    FilesListTooLarge { count: u16, max: usize },

    #[error("Buffer full: {requested} bytes requested, {available} of {capacity} free")]
    BufferFull {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    #[error("File {0} is not addressed to this device")]
    UnauthorizedDevice(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),
}

pub type Result<T> = std::result::Result<T, ArincError>;
