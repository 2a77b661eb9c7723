//! TFTP (RFC 1350 subset) used by the target: wire packets, the passive
//! session workers spawned from the well-known port, and the active client
//! that fetches loads and uploads status files.

pub mod client;
pub mod packet;
pub mod session;

pub use client::{TftpClient, TransferSummary};
pub use packet::{ErrorCode, Opcode, Packet};
pub use session::{SessionConfig, SessionContext};
