use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TargetError};

// RFC 1350 - The TFTP Protocol (Revision 2)
pub const BLOCK_SIZE: usize = 512;
pub const MAX_PACKET_SIZE: usize = BLOCK_SIZE + 4;
pub const OCTET_MODE: &str = "octet";

// RFC 1350: strings are NUL terminated; longer ones are refused outright
const MAX_STRING_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
}

impl TryFrom<u16> for Opcode {
    type Error = TargetError;

    fn try_from(value: u16) -> std::result::Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            _ => Err(TargetError::MalformedPacket(format!("Invalid opcode: {}", value))),
        }
    }
}

// RFC 1350 - TFTP Error Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,       // Not defined, see error message
    FileNotFound = 1,     // File not found
    AccessViolation = 2,  // Access violation
    DiskFull = 3,         // Disk full or allocation exceeded
    IllegalOperation = 4, // Illegal TFTP operation
    UnknownTid = 5,       // Unknown transfer ID
    FileExists = 6,       // File already exists
    NoSuchUser = 7,       // No such user
}

/// A decoded TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String, mode: String },
    Wrq { filename: String, mode: String },
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Packet> {
        let mut bytes = BytesMut::from(data);
        if bytes.len() < 2 {
            return Err(TargetError::MalformedPacket("Packet too short".to_string()));
        }

        match Opcode::try_from(bytes.get_u16())? {
            opcode @ (Opcode::Rrq | Opcode::Wrq) => {
                // RFC 1350: opcode | filename | 0 | mode | 0
                // Trailing RFC 2347 options are ignored.
                let filename = parse_string(&mut bytes)?;
                let mode = parse_string(&mut bytes)?;
                if opcode == Opcode::Rrq {
                    Ok(Packet::Rrq { filename, mode })
                } else {
                    Ok(Packet::Wrq { filename, mode })
                }
            }
            Opcode::Data => {
                if bytes.len() < 2 {
                    return Err(TargetError::MalformedPacket(
                        "DATA packet missing block number".to_string(),
                    ));
                }
                let block = bytes.get_u16();
                if bytes.len() > BLOCK_SIZE {
                    return Err(TargetError::MalformedPacket(format!(
                        "DATA block {} carries {} bytes",
                        block,
                        bytes.len()
                    )));
                }
                Ok(Packet::Data {
                    block,
                    payload: bytes.freeze(),
                })
            }
            Opcode::Ack => {
                if bytes.len() < 2 {
                    return Err(TargetError::MalformedPacket(
                        "ACK packet missing block number".to_string(),
                    ));
                }
                Ok(Packet::Ack {
                    block: bytes.get_u16(),
                })
            }
            Opcode::Error => {
                if bytes.len() < 2 {
                    return Err(TargetError::MalformedPacket(
                        "ERROR packet missing code".to_string(),
                    ));
                }
                let code = bytes.get_u16();
                // Peers do not always terminate the message.
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                let message = String::from_utf8_lossy(&bytes[..end]).into_owned();
                Ok(Packet::Error { code, message })
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Packet::Rrq { filename, mode } | Packet::Wrq { filename, mode } => {
                let mut packet = BytesMut::with_capacity(4 + filename.len() + mode.len());
                packet.put_u16(self.opcode() as u16);
                packet.put_slice(filename.as_bytes());
                packet.put_u8(0);
                packet.put_slice(mode.as_bytes());
                packet.put_u8(0);
                packet.freeze()
            }
            Packet::Data { block, payload } => data_packet(*block, payload),
            Packet::Ack { block } => ack_packet(*block),
            Packet::Error { code, message } => {
                let mut packet = BytesMut::with_capacity(5 + message.len());
                packet.put_u16(Opcode::Error as u16);
                packet.put_u16(*code);
                packet.put_slice(message.as_bytes());
                packet.put_u8(0); // Null terminator
                packet.freeze()
            }
        }
    }
}

pub fn data_packet(block: u16, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(4 + payload.len());
    packet.put_u16(Opcode::Data as u16);
    packet.put_u16(block);
    packet.put_slice(payload);
    packet.freeze()
}

pub fn ack_packet(block: u16) -> Bytes {
    let mut packet = BytesMut::with_capacity(4);
    packet.put_u16(Opcode::Ack as u16);
    packet.put_u16(block);
    packet.freeze()
}

pub fn error_packet(code: ErrorCode, message: &str) -> Bytes {
    Packet::Error {
        code: code as u16,
        message: message.to_string(),
    }
    .encode()
}

/// Payload of block `index` (1-based) of `payload`, recomputed from its
/// offset. A payload that is an exact multiple of the block size ends with
/// an empty block.
pub fn block_slice(payload: &[u8], index: usize) -> &[u8] {
    let start = index.saturating_sub(1).saturating_mul(BLOCK_SIZE).min(payload.len());
    let end = (start + BLOCK_SIZE).min(payload.len());
    &payload[start..end]
}

/// Number of DATA blocks needed to send `len` bytes.
pub fn block_count(len: usize) -> usize {
    len / BLOCK_SIZE + 1
}

/// Wire block number for a 1-based block index; wraps past 65535.
pub fn wire_block(index: usize) -> u16 {
    (index % 65536) as u16
}

/// Parse a NUL terminated string from a TFTP packet.
fn parse_string(bytes: &mut BytesMut) -> Result<String> {
    let search_len = bytes.len().min(MAX_STRING_LENGTH + 1);
    let null_pos = bytes[..search_len]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| {
            if bytes.len() > MAX_STRING_LENGTH {
                TargetError::MalformedPacket("String too long (exceeds 255 bytes)".to_string())
            } else {
                TargetError::MalformedPacket("No null terminator found".to_string())
            }
        })?;

    let string_bytes = bytes.split_to(null_pos);
    bytes.advance(1); // Skip the null terminator

    String::from_utf8(string_bytes.to_vec())
        .map_err(|e| TargetError::MalformedPacket(format!("Invalid UTF-8: {}", e)))
}
