//! ARINC 615A load-upload records exchanged between a data loader and its
//! target: LUI, LUR and LUS serialization and parsing, file-name
//! classification, and the buffer that accumulates an incoming LUR.
//!
//! All integers on the wire are big-endian.

pub mod buffer;
mod cursor;
pub mod error;
pub mod filename;
pub mod lui;
pub mod lur;
pub mod lus;
pub mod types;

pub use buffer::{AccumulationBuffer, BufferClaim};
pub use error::{ArincError, Result};
pub use filename::{RecordKind, classify_filename};
pub use lui::{LoadUploadInitialization, MAX_LUI_SIZE, parse_lui, serialize_lui};
pub use lur::{LoadUploadRequest, LurFileEntry, MAX_LUR_SIZE, parse_lur};
pub use lus::{LoadUploadStatus, LusFileStatus, MAX_LUS_SIZE, parse_lus, serialize_lus};
pub use types::{ArincStatusCode, MAX_FILES_PER_TRANSFER, PROTOCOL_VERSION, ProgressRatio};
