//! Protocol module - Defines the wire protocol spoken with game clients
//!
//! Every packet is framed as:
//! - 4 bytes size (little-endian), counting itself plus the payload
//! - 2 bytes opcode (little-endian)
//! - Variable length payload, built from the reader/writer primitives and
//!   possibly bit-packed internally

mod framing;
pub mod message;
mod opcode;
mod reader;
mod writer;

pub use framing::*;
pub use message::{ConnectionType, ReadMessage, WriteMessage};
pub use opcode::{Opcode, UnknownOpcodeName};
pub use reader::{PacketReader, ReadError, ReadResult};
pub use writer::PacketWriter;

/// Protocol version announced in the greeting and expected from clients
pub const PROTOCOL_VERSION: u32 = 16042;

/// Default port for the auth gateway
pub const DEFAULT_PORT: u16 = 23115;
