//! Load Upload Initialization (LUI): the target's answer to a read request.
//!
//! Layout: `[u32 length][version "A4"][u16 status][u8 desc_len][desc]`.

use bytes::Bytes;

use crate::cursor::{RecordReader, RecordWriter};
use crate::error::Result;
use crate::types::{ArincStatusCode, LENGTH_FIELD_LEN, MAX_FIELD_LEN, VERSION_LEN};

/// Largest LUI the target ever emits.
pub const MAX_LUI_SIZE: usize = LENGTH_FIELD_LEN + VERSION_LEN + 2 + 1 + MAX_FIELD_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadUploadInitialization {
    pub protocol_version: [u8; 2],
    pub status: ArincStatusCode,
    pub description: String,
}

/// Serializes an LUI into a buffer of `MAX_LUI_SIZE` bytes.
pub fn serialize_lui(status: ArincStatusCode, description: Option<&str>) -> Result<Bytes> {
    serialize_lui_with_capacity(status, description, MAX_LUI_SIZE)
}

pub fn serialize_lui_with_capacity(
    status: ArincStatusCode,
    description: Option<&str>,
    capacity: usize,
) -> Result<Bytes> {
    let mut writer = RecordWriter::new(capacity)?;
    writer.put_slice(&crate::types::PROTOCOL_VERSION)?;
    writer.put_u16(status.code())?;
    writer.put_prefixed("description", description.unwrap_or_default().as_bytes())?;
    writer.finish()
}

pub fn parse_lui(buf: &[u8]) -> Result<LoadUploadInitialization> {
    let mut reader = RecordReader::new(buf);
    let _length = reader.read_u32()?;
    let protocol_version = reader.read_array::<2>()?;
    let status_offset = reader.offset();
    let status = ArincStatusCode::try_from(reader.read_u16()?).map_err(|e| {
        crate::error::ArincError::MalformedPacket {
            offset: status_offset,
            reason: e.to_string(),
        }
    })?;
    let description = reader.read_prefixed_str("description")?;
    Ok(LoadUploadInitialization {
        protocol_version,
        status,
        description,
    })
}
