use serde::{Deserialize, Serialize};

use crate::error::{ArincError, Result};

/// Protocol version carried by every record ("A4").
pub const PROTOCOL_VERSION: [u8; 2] = [0x41, 0x34];

/// Most files a single load upload request may name.
pub const MAX_FILES_PER_TRANSFER: usize = 3;

/// Longest description, file name or part number (u8 length prefix).
pub const MAX_FIELD_LEN: usize = 255;

pub(crate) const LENGTH_FIELD_LEN: usize = 4;
pub(crate) const VERSION_LEN: usize = 2;
pub(crate) const RATIO_LEN: usize = 3;

/// Status codes shared by LUI and LUS records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ArincStatusCode {
    Accepted = 0x0001,
    InProgress = 0x0002,
    CompletedWithoutError = 0x0003,
    InProgressWithInfo = 0x0004,
    NotAccepted = 0x1000,
    NotSupported = 0x1002,
    AbortedByTarget = 0x1003,
    AbortedByDataLoader = 0x1004,
    AbortedByOperator = 0x1005,
    RequiredDataError = 0x1007,
}

impl ArincStatusCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// True for the codes that end an operation with a failure.
    pub fn is_failure(self) -> bool {
        self.code() >= 0x1000
    }
}

impl TryFrom<u16> for ArincStatusCode {
    type Error = ArincError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x0001 => Ok(Self::Accepted),
            0x0002 => Ok(Self::InProgress),
            0x0003 => Ok(Self::CompletedWithoutError),
            0x0004 => Ok(Self::InProgressWithInfo),
            0x1000 => Ok(Self::NotAccepted),
            0x1002 => Ok(Self::NotSupported),
            0x1003 => Ok(Self::AbortedByTarget),
            0x1004 => Ok(Self::AbortedByDataLoader),
            0x1005 => Ok(Self::AbortedByOperator),
            0x1007 => Ok(Self::RequiredDataError),
            other => Err(ArincError::InvalidArgument(format!(
                "unknown status code 0x{other:04x}"
            ))),
        }
    }
}

/// Upload progress as three ASCII digits, "000" to "100".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressRatio([u8; RATIO_LEN]);

impl ProgressRatio {
    pub const ZERO: ProgressRatio = ProgressRatio(*b"000");
    pub const COMPLETE: ProgressRatio = ProgressRatio(*b"100");

    pub fn from_percent(percent: u8) -> Self {
        let percent = percent.min(100);
        Self([b'0' + percent / 100, b'0' + (percent / 10) % 10, b'0' + percent % 10])
    }

    pub fn from_bytes(bytes: [u8; RATIO_LEN]) -> Result<Self> {
        let ratio = Self(bytes);
        match ratio.digits() {
            Some(value) if value <= 100 => Ok(ratio),
            _ => Err(ArincError::InvalidArgument(format!(
                "invalid progress ratio {:?}",
                String::from_utf8_lossy(&bytes)
            ))),
        }
    }

    pub fn percent(&self) -> u8 {
        self.digits().map(|v| v as u8).unwrap_or(0)
    }

    pub fn as_bytes(&self) -> &[u8; RATIO_LEN] {
        &self.0
    }

    fn digits(&self) -> Option<u16> {
        self.0.iter().try_fold(0u16, |acc, b| {
            b.is_ascii_digit().then(|| acc * 10 + u16::from(b - b'0'))
        })
    }
}

impl Default for ProgressRatio {
    fn default() -> Self {
        Self::ZERO
    }
}

impl std::fmt::Display for ProgressRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.percent())
    }
}
