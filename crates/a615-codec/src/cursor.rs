use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ArincError, Result};
use crate::types::{LENGTH_FIELD_LEN, MAX_FIELD_LEN};

/// Bounds-checked reader over a received record.
///
/// Every read verifies `offset + n <= len` first, so a truncated or hostile
/// record yields `MalformedPacket` instead of an out-of-range slice.
pub(crate) struct RecordReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> RecordReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub(crate) fn malformed(&self, reason: impl Into<String>) -> ArincError {
        ArincError::MalformedPacket {
            offset: self.offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(self.malformed(format!(
                "needs {} bytes, {} remaining",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        let mut bytes = self.take(1)?;
        Ok(bytes.get_u8())
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let mut bytes = self.take(2)?;
        Ok(bytes.get_u16())
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let mut bytes = self.take(4)?;
        Ok(bytes.get_u32())
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a `u8` length followed by that many bytes of UTF-8 text. The
    /// length may count a NUL terminator; the text stops at the first NUL.
    pub(crate) fn read_prefixed_str(&mut self, field: &str) -> Result<String> {
        let len = usize::from(self.read_u8()?);
        let start = self.offset;
        let raw = self.take(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8(raw[..end].to_vec()).map_err(|_| ArincError::MalformedPacket {
            offset: start,
            reason: format!("{field} is not valid UTF-8"),
        })
    }
}

/// Capacity-checked record writer.
///
/// Starts with a zeroed length placeholder; `finish` patches it with the
/// number of bytes that follow the length field. Each put checks the fixed
/// capacity before writing, so an oversized record fails with `NoMem` and no
/// partial output is handed out.
pub(crate) struct RecordWriter {
    buf: BytesMut,
    capacity: usize,
}

impl RecordWriter {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        let mut writer = Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        };
        writer.ensure(LENGTH_FIELD_LEN)?;
        writer.buf.put_u32(0);
        Ok(writer)
    }

    fn ensure(&self, n: usize) -> Result<()> {
        let needed = self.buf.len() + n;
        if needed > self.capacity {
            return Err(ArincError::NoMem {
                needed,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub(crate) fn put_u8(&mut self, value: u8) -> Result<()> {
        self.ensure(1)?;
        self.buf.put_u8(value);
        Ok(())
    }

    pub(crate) fn put_u16(&mut self, value: u16) -> Result<()> {
        self.ensure(2)?;
        self.buf.put_u16(value);
        Ok(())
    }

    pub(crate) fn put_slice(&mut self, value: &[u8]) -> Result<()> {
        self.ensure(value.len())?;
        self.buf.put_slice(value);
        Ok(())
    }

    /// Writes a `u8` length prefix followed by the bytes of `value`.
    pub(crate) fn put_prefixed(&mut self, field: &str, value: &[u8]) -> Result<()> {
        let len = u8::try_from(value.len()).map_err(|_| {
            ArincError::InvalidArgument(format!(
                "{field} is {} bytes, at most {MAX_FIELD_LEN} allowed",
                value.len()
            ))
        })?;
        self.ensure(1 + value.len())?;
        self.buf.put_u8(len);
        self.buf.put_slice(value);
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<Bytes> {
        let body_len = u32::try_from(self.buf.len() - LENGTH_FIELD_LEN).map_err(|_| {
            ArincError::NoMem {
                needed: self.buf.len(),
                capacity: self.capacity,
            }
        })?;
        self.buf[..LENGTH_FIELD_LEN].copy_from_slice(&body_len.to_be_bytes());
        Ok(self.buf.freeze())
    }
}
