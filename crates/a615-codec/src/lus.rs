//! Load Upload Status (LUS): progress reports the target uploads to the data
//! loader while a load is in flight.

use bytes::Bytes;

use crate::cursor::{RecordReader, RecordWriter};
use crate::error::{ArincError, Result};
use crate::types::{
    ArincStatusCode, LENGTH_FIELD_LEN, MAX_FIELD_LEN, MAX_FILES_PER_TRANSFER, PROTOCOL_VERSION,
    ProgressRatio, RATIO_LEN, VERSION_LEN,
};

const LUS_HEADER_MAX: usize =
    LENGTH_FIELD_LEN + VERSION_LEN + 2 + 1 + MAX_FIELD_LEN + 2 + 2 + 2 + RATIO_LEN + 2;
const LUS_FILE_MAX: usize = 1 + MAX_FIELD_LEN + 1 + MAX_FIELD_LEN + RATIO_LEN + 2 + 1 + MAX_FIELD_LEN;

/// Capacity used when generating an LUS.
pub const MAX_LUS_SIZE: usize = LUS_HEADER_MAX + MAX_FILES_PER_TRANSFER * LUS_FILE_MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LusFileStatus {
    pub name: String,
    pub part_number: String,
    pub ratio: ProgressRatio,
    pub status: ArincStatusCode,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadUploadStatus {
    pub status: ArincStatusCode,
    pub description: String,
    pub counter: u16,
    pub exception_timer: u16,
    pub estimated_time: u16,
    pub ratio: ProgressRatio,
    pub files: Vec<LusFileStatus>,
}

impl LoadUploadStatus {
    pub fn new(status: ArincStatusCode, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
            counter: 0,
            exception_timer: 0,
            estimated_time: 0,
            ratio: ProgressRatio::ZERO,
            files: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        self.encode_with_capacity(MAX_LUS_SIZE)
    }

    /// Serializes the record, checking `capacity` before each write.
    pub fn encode_with_capacity(&self, capacity: usize) -> Result<Bytes> {
        let file_count = u16::try_from(self.files.len()).map_err(|_| {
            ArincError::InvalidArgument(format!("{} file statuses", self.files.len()))
        })?;

        let mut writer = RecordWriter::new(capacity)?;
        writer.put_slice(&PROTOCOL_VERSION)?;
        writer.put_u16(self.status.code())?;
        writer.put_prefixed("description", self.description.as_bytes())?;
        writer.put_u16(self.counter)?;
        writer.put_u16(self.exception_timer)?;
        writer.put_u16(self.estimated_time)?;
        writer.put_slice(self.ratio.as_bytes())?;
        writer.put_u16(file_count)?;

        for file in &self.files {
            writer.put_prefixed("file name", file.name.as_bytes())?;
            writer.put_prefixed("part number", file.part_number.as_bytes())?;
            writer.put_slice(file.ratio.as_bytes())?;
            writer.put_u16(file.status.code())?;
            writer.put_prefixed("file description", file.description.as_bytes())?;
        }

        writer.finish()
    }
}

/// Serializes an LUS with a zero estimated time and a ratio derived from the
/// file statuses.
pub fn serialize_lus(
    status: ArincStatusCode,
    description: &str,
    counter: u16,
    exception_timer: u16,
    files: &[LusFileStatus],
) -> Result<Bytes> {
    let ratio = files
        .iter()
        .map(|f| f.ratio.percent())
        .min()
        .map(ProgressRatio::from_percent)
        .unwrap_or_default();
    LoadUploadStatus {
        status,
        description: description.to_string(),
        counter,
        exception_timer,
        estimated_time: 0,
        ratio,
        files: files.to_vec(),
    }
    .encode()
}

pub fn parse_lus(buf: &[u8]) -> Result<LoadUploadStatus> {
    let mut reader = RecordReader::new(buf);
    let _length = reader.read_u32()?;
    let _version = reader.read_array::<VERSION_LEN>()?;
    let status = read_status(&mut reader)?;
    let description = reader.read_prefixed_str("description")?;
    let counter = reader.read_u16()?;
    let exception_timer = reader.read_u16()?;
    let estimated_time = reader.read_u16()?;
    let ratio = read_ratio(&mut reader)?;
    let count = reader.read_u16()?;

    let mut files = Vec::new();
    for _ in 0..count {
        let name = reader.read_prefixed_str("file name")?;
        let part_number = reader.read_prefixed_str("part number")?;
        let ratio = read_ratio(&mut reader)?;
        let status = read_status(&mut reader)?;
        let description = reader.read_prefixed_str("file description")?;
        files.push(LusFileStatus {
            name,
            part_number,
            ratio,
            status,
            description,
        });
    }

    Ok(LoadUploadStatus {
        status,
        description,
        counter,
        exception_timer,
        estimated_time,
        ratio,
        files,
    })
}

fn read_status(reader: &mut RecordReader<'_>) -> Result<ArincStatusCode> {
    let offset = reader.offset();
    ArincStatusCode::try_from(reader.read_u16()?).map_err(|e| ArincError::MalformedPacket {
        offset,
        reason: e.to_string(),
    })
}

fn read_ratio(reader: &mut RecordReader<'_>) -> Result<ProgressRatio> {
    let offset = reader.offset();
    ProgressRatio::from_bytes(reader.read_array::<RATIO_LEN>()?).map_err(|e| {
        ArincError::MalformedPacket {
            offset,
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(status: ArincStatusCode, percent: u8) -> LusFileStatus {
        LusFileStatus {
            name: "EMB-HW-002-021-003.LUH".to_string(),
            part_number: "IMG-0001".to_string(),
            ratio: ProgressRatio::from_percent(percent),
            status,
            description: String::new(),
        }
    }

    #[test]
    fn header_layout_matches_wire_order() {
        let record = LoadUploadStatus {
            status: ArincStatusCode::InProgress,
            description: "op".to_string(),
            counter: 1,
            exception_timer: 20,
            estimated_time: 3,
            ratio: ProgressRatio::from_percent(50),
            files: Vec::new(),
        };
        let bytes = record.encode().unwrap();
        let expected: &[u8] = &[
            0, 0, 0, 18, // length of everything after the field
            0x41, 0x34, // version
            0x00, 0x02, // status
            2, b'o', b'p', // description
            0x00, 0x01, // counter
            0x00, 0x14, // exception timer
            0x00, 0x03, // estimated time
            b'0', b'5', b'0', // ratio
            0x00, 0x00, // file count
        ];
        assert_eq!(&bytes[..], expected);
    }

    #[test]
    fn serialize_lus_derives_overall_ratio() {
        let files = [
            file(ArincStatusCode::InProgress, 40),
            file(ArincStatusCode::CompletedWithoutError, 100),
        ];
        let bytes = serialize_lus(
            ArincStatusCode::InProgress,
            "operation in progress",
            1,
            20,
            &files,
        )
        .unwrap();
        let parsed = parse_lus(&bytes).unwrap();
        assert_eq!(parsed.ratio, ProgressRatio::from_percent(40));
        assert_eq!(parsed.files, files);
        assert_eq!(parsed.exception_timer, 20);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let record = LoadUploadStatus {
            files: vec![file(ArincStatusCode::InProgress, 10); 2],
            ..LoadUploadStatus::new(ArincStatusCode::InProgress, "operation in progress")
        };
        let full = record.encode().unwrap();
        for capacity in 0..full.len() {
            match record.encode_with_capacity(capacity) {
                Err(ArincError::NoMem { needed, capacity: c }) => {
                    assert_eq!(c, capacity);
                    assert!(needed > capacity);
                }
                other => panic!("capacity {capacity}: expected NoMem, got {other:?}"),
            }
        }
        assert_eq!(record.encode_with_capacity(full.len()).unwrap(), full);
    }

    #[test]
    fn full_size_status_fits_generation_capacity() {
        let long = "x".repeat(MAX_FIELD_LEN);
        let record = LoadUploadStatus {
            description: long.clone(),
            files: vec![
                LusFileStatus {
                    name: long.clone(),
                    part_number: long.clone(),
                    ratio: ProgressRatio::COMPLETE,
                    status: ArincStatusCode::CompletedWithoutError,
                    description: long.clone(),
                };
                MAX_FILES_PER_TRANSFER
            ],
            ..LoadUploadStatus::new(ArincStatusCode::CompletedWithoutError, "")
        };
        assert_eq!(record.encode().unwrap().len(), MAX_LUS_SIZE);
    }
}
