//! Load Upload Request (LUR): the list of files the data loader wants the
//! target to fetch.
//!
//! Layout: `[u32 length][u16 version][u16 file_count]` followed by
//! `file_count` entries of `[u8 name_len][name][u8 pn_len][part_number]`.

use bytes::Bytes;

use crate::cursor::{RecordReader, RecordWriter};
use crate::error::{ArincError, Result};
use crate::types::{LENGTH_FIELD_LEN, MAX_FIELD_LEN, MAX_FILES_PER_TRANSFER, VERSION_LEN};

pub const LUR_HEADER_LEN: usize = LENGTH_FIELD_LEN + VERSION_LEN + 2;

/// Largest LUR the target will accumulate: the header plus the maximum
/// number of entries, each at full field length.
pub const MAX_LUR_SIZE: usize =
    LUR_HEADER_LEN + MAX_FILES_PER_TRANSFER * (1 + MAX_FIELD_LEN + 1 + MAX_FIELD_LEN);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LurFileEntry {
    pub name: String,
    pub part_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadUploadRequest {
    pub protocol_version: u16,
    pub files: Vec<LurFileEntry>,
}

impl LoadUploadRequest {
    pub fn new(files: Vec<LurFileEntry>) -> Self {
        Self {
            protocol_version: u16::from_be_bytes(crate::types::PROTOCOL_VERSION),
            files,
        }
    }

    /// The first requested file, which is what the target downloads.
    pub fn primary(&self) -> Option<&LurFileEntry> {
        self.files.first()
    }

    pub fn encode(&self) -> Result<Bytes> {
        if self.files.len() > MAX_FILES_PER_TRANSFER {
            return Err(ArincError::FilesListTooLarge {
                count: u16::try_from(self.files.len()).unwrap_or(u16::MAX),
                max: MAX_FILES_PER_TRANSFER,
            });
        }
        let mut writer = RecordWriter::new(MAX_LUR_SIZE)?;
        writer.put_u16(self.protocol_version)?;
        writer.put_u16(self.files.len() as u16)?;
        for entry in &self.files {
            writer.put_prefixed("file name", entry.name.as_bytes())?;
            writer.put_prefixed("part number", entry.part_number.as_bytes())?;
        }
        writer.finish()
    }
}

/// Parses an accumulated LUR.
///
/// The declared length must not exceed the buffer, the file count must not
/// exceed `MAX_FILES_PER_TRANSFER`, and every field is bounds-checked against
/// the buffer before it is read.
pub fn parse_lur(buf: &[u8]) -> Result<LoadUploadRequest> {
    let mut reader = RecordReader::new(buf);

    let declared = reader.read_u32()? as usize;
    if declared > buf.len() {
        return Err(ArincError::MalformedPacket {
            offset: 0,
            reason: format!(
                "declared length {declared} exceeds received {} bytes",
                buf.len()
            ),
        });
    }

    let protocol_version = reader.read_u16()?;
    let count = reader.read_u16()?;
    if usize::from(count) > MAX_FILES_PER_TRANSFER {
        return Err(ArincError::FilesListTooLarge {
            count,
            max: MAX_FILES_PER_TRANSFER,
        });
    }

    let mut files = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let name = reader.read_prefixed_str("file name")?;
        let part_number = reader.read_prefixed_str("part number")?;
        files.push(LurFileEntry { name, part_number });
    }

    Ok(LoadUploadRequest {
        protocol_version,
        files,
    })
}
