//! Packet framing
//!
//! Every packet on the wire is a 6-byte header followed by the payload:
//! - 4 bytes size (little-endian), equal to 4 + payload length
//! - 2 bytes opcode (little-endian)
//!
//! [`extract_packets`] is the only place TCP stream reassembly happens. It
//! carries no size policy of its own; the connection decides what an absurd
//! size field means by inspecting [`pending_header`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::Opcode;

/// Width of the size field, counted by the size field itself
pub const SIZE_FIELD_LEN: usize = 4;

/// Header size: size(4) + opcode(2) = 6 bytes
pub const HEADER_SIZE: usize = 6;

/// Largest payload the size field can describe
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize - SIZE_FIELD_LEN;

/// Framing errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Payload too large to frame: {0} bytes (max: {})", MAX_PAYLOAD_LEN)]
    PayloadTooLarge(usize),
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw size field: 4 + payload length
    pub size: u32,
    pub opcode: u16,
}

impl PacketHeader {
    /// Header for a payload of `payload_len` bytes
    pub fn for_payload(opcode: u16, payload_len: usize) -> Result<Self, FrameError> {
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }

        Ok(Self {
            size: (payload_len + SIZE_FIELD_LEN) as u32,
            opcode,
        })
    }

    /// Payload length declared by the size field. `None` when the size field
    /// is smaller than its own width, which no well-formed peer sends.
    pub fn payload_len(&self) -> Option<usize> {
        (self.size as usize).checked_sub(SIZE_FIELD_LEN)
    }

    /// Total bytes this packet occupies on the wire
    pub fn frame_len(&self) -> Option<usize> {
        self.payload_len().map(|len| len + HEADER_SIZE)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        build_header(self.size, self.opcode)
    }
}

/// A complete packet lifted off the wire. The opcode stays a raw integer
/// because unknown values are legal traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub opcode: u16,
    pub payload: Bytes,
}

impl RawPacket {
    pub fn new(opcode: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Registry lookup of the opcode
    pub fn known_opcode(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode)
    }
}

pub fn build_header(size: u32, opcode: u16) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&size.to_le_bytes());
    header[4..].copy_from_slice(&opcode.to_le_bytes());
    header
}

/// Parse a header from the front of `buf`. Returns `None` if fewer than
/// [`HEADER_SIZE`] bytes are available.
pub fn parse_header(buf: &[u8]) -> Option<PacketHeader> {
    if buf.len() < HEADER_SIZE {
        return None;
    }

    Some(PacketHeader {
        size: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        opcode: u16::from_le_bytes([buf[4], buf[5]]),
    })
}

/// Append a framed packet to `buf`
pub fn encode_packet(opcode: u16, payload: &[u8], buf: &mut BytesMut) -> Result<(), FrameError> {
    let header = PacketHeader::for_payload(opcode, payload.len())?;

    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(payload);
    Ok(())
}

/// Header followed by payload
pub fn frame_packet(opcode: u16, payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_packet(opcode, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Split every complete packet off the front of `buf`.
///
/// Whatever is left in `buf` afterwards is the remainder: a partial header,
/// or a header whose declared payload has not fully arrived. Payloads are
/// split off without copying.
pub fn extract_packets(buf: &mut BytesMut) -> Vec<RawPacket> {
    let mut packets = Vec::new();

    while let Some(header) = parse_header(buf) {
        let Some(frame_len) = header.frame_len() else {
            break;
        };
        if buf.len() < frame_len {
            break;
        }

        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(frame_len - HEADER_SIZE).freeze();
        packets.push(RawPacket {
            opcode: header.opcode,
            payload,
        });
    }

    packets
}

/// Header of the incomplete packet at the front of `buf`, if one is parsed
pub fn pending_header(buf: &[u8]) -> Option<PacketHeader> {
    parse_header(buf)
}
