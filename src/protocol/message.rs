//! Protocol message definitions
//!
//! Typed messages exchanged by the gateway itself during the handshake.
//! Game-level messages live with the subsystems that own them; they plug in
//! through the same [`ReadMessage`] / [`WriteMessage`] traits.

use serde::{Deserialize, Serialize};

use super::{Opcode, PacketReader, PacketWriter, ReadResult};

/// A message that can be decoded from a packet payload
pub trait ReadMessage: Sized {
    const OPCODE: Opcode;

    fn read(reader: &mut PacketReader<'_>) -> ReadResult<Self>;
}

/// A message that can be encoded into a packet payload
pub trait WriteMessage {
    const OPCODE: Opcode;

    fn write(&self, writer: &mut PacketWriter);
}

/// Which service a listener fronts. Selects the key seed and is announced to
/// the client in the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Auth,
    World,
}

impl ConnectionType {
    /// Width of the connection type field in [`ServerHello`]
    pub const BITS: u32 = 5;

    pub fn wire_value(self) -> u64 {
        match self {
            ConnectionType::Auth => 3,
            ConnectionType::World => 11,
        }
    }

    pub fn from_wire_value(value: u64) -> Option<Self> {
        match value {
            3 => Some(ConnectionType::Auth),
            11 => Some(ConnectionType::World),
            _ => None,
        }
    }
}

/// Greeting sent on accept, before encryption is active.
/// The first field is always the protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub auth_version: u32,
    pub realm_id: u32,
    pub realm_group_id: u32,
    /// Unix seconds the listener came up
    pub startup_time: u64,
    pub listen_port: u16,
    /// Raw 5-bit connection type, see [`ConnectionType::wire_value`]
    pub connection_type: u8,
    pub network_message_crc: u32,
    pub process_id: u32,
}

impl WriteMessage for ServerHello {
    const OPCODE: Opcode = Opcode::ServerHello;

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.auth_version);
        writer.write_u32(self.realm_id);
        writer.write_u32(self.realm_group_id);
        writer.write_u64(self.startup_time);
        writer.write_u16(self.listen_port);
        writer.write_bits(u64::from(self.connection_type), ConnectionType::BITS);
        writer.write_u32(self.network_message_crc);
        writer.write_u32(self.process_id);
    }
}

impl ReadMessage for ServerHello {
    const OPCODE: Opcode = Opcode::ServerHello;

    fn read(reader: &mut PacketReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            auth_version: reader.read_u32()?,
            realm_id: reader.read_u32()?,
            realm_group_id: reader.read_u32()?,
            startup_time: reader.read_u64()?,
            listen_port: reader.read_u16()?,
            connection_type: reader.read_bits(ConnectionType::BITS)? as u8,
            network_message_crc: reader.read_u32()?,
            process_id: reader.read_u32()?,
        })
    }
}

/// Credentials presented to the auth gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloAuth {
    /// Client build, compared against the protocol version
    pub build: u32,
    pub account: String,
    /// Opaque token issued by the login service
    pub token: [u8; 16],
    /// 4-bit client language
    pub language: u8,
}

impl ReadMessage for ClientHelloAuth {
    const OPCODE: Opcode = Opcode::ClientHelloAuth;

    fn read(reader: &mut PacketReader<'_>) -> ReadResult<Self> {
        let build = reader.read_u32()?;
        let account = reader.read_wide_string()?;
        let mut token = [0u8; 16];
        token.copy_from_slice(reader.read_bytes(16)?);
        let language = reader.read_bits(4)? as u8;

        Ok(Self {
            build,
            account,
            token,
            language,
        })
    }
}

impl WriteMessage for ClientHelloAuth {
    const OPCODE: Opcode = Opcode::ClientHelloAuth;

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.build);
        writer.write_wide_string(&self.account);
        writer.write_bytes(&self.token);
        writer.write_bits(u64::from(self.language), 4);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAuthAccepted {
    pub account_id: u32,
    /// Key the client presents to the world gateway
    pub session_key: [u8; 16],
}

impl WriteMessage for ServerAuthAccepted {
    const OPCODE: Opcode = Opcode::ServerAuthAccepted;

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.account_id);
        writer.write_bytes(&self.session_key);
    }
}

impl ReadMessage for ServerAuthAccepted {
    const OPCODE: Opcode = Opcode::ServerAuthAccepted;

    fn read(reader: &mut PacketReader<'_>) -> ReadResult<Self> {
        let account_id = reader.read_u32()?;
        let mut session_key = [0u8; 16];
        session_key.copy_from_slice(reader.read_bytes(16)?);
        Ok(Self {
            account_id,
            session_key,
        })
    }
}

/// Reason codes for [`ServerAuthDenied`]
pub mod deny_codes {
    pub const UNKNOWN: u32 = 0;
    pub const VERSION_MISMATCH: u32 = 19;
    pub const INVALID_TOKEN: u32 = 16;
    pub const ACCOUNT_SUSPENDED: u32 = 20;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAuthDenied {
    pub reason: u32,
    pub error_value: u32,
    pub suspended_days: u32,
}

impl WriteMessage for ServerAuthDenied {
    const OPCODE: Opcode = Opcode::ServerAuthDenied;

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.reason);
        writer.write_u32(self.error_value);
        writer.write_u32(self.suspended_days);
    }
}

impl ReadMessage for ServerAuthDenied {
    const OPCODE: Opcode = Opcode::ServerAuthDenied;

    fn read(reader: &mut PacketReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            reason: reader.read_u32()?,
            error_value: reader.read_u32()?,
            suspended_days: reader.read_u32()?,
        })
    }
}

/// Keep-alive, echoed back as [`ServerHeartbeat`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHeartbeat {
    pub timestamp: u64,
}

impl ReadMessage for ClientHeartbeat {
    const OPCODE: Opcode = Opcode::ClientHeartbeat;

    fn read(reader: &mut PacketReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            timestamp: reader.read_u64()?,
        })
    }
}

impl WriteMessage for ClientHeartbeat {
    const OPCODE: Opcode = Opcode::ClientHeartbeat;

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u64(self.timestamp);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHeartbeat {
    pub timestamp: u64,
}

impl WriteMessage for ServerHeartbeat {
    const OPCODE: Opcode = Opcode::ServerHeartbeat;

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u64(self.timestamp);
    }
}

impl ReadMessage for ServerHeartbeat {
    const OPCODE: Opcode = Opcode::ServerHeartbeat;

    fn read(reader: &mut PacketReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            timestamp: reader.read_u64()?,
        })
    }
}

/// Encode a message into a standalone payload
pub fn encode_message<M: WriteMessage>(message: &M) -> bytes::Bytes {
    let mut writer = PacketWriter::new();
    message.write(&mut writer);
    writer.into_bytes()
}

/// Decode a message from a payload
pub fn decode_message<M: ReadMessage>(payload: &[u8]) -> ReadResult<M> {
    M::read(&mut PacketReader::new(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ReadError, PROTOCOL_VERSION};

    fn sample_hello() -> ServerHello {
        ServerHello {
            auth_version: PROTOCOL_VERSION,
            realm_id: 1,
            realm_group_id: 21,
            startup_time: 1_700_000_000,
            listen_port: 23115,
            connection_type: ConnectionType::Auth.wire_value() as u8,
            network_message_crc: 0x5A3F_10C2,
            process_id: 4242,
        }
    }

    #[test]
    fn test_server_hello_layout() {
        let payload = encode_message(&sample_hello());
        // 4 + 4 + 4 + 8 + 2 + 1 (5 bits, padded) + 4 + 4
        assert_eq!(payload.len(), 31);
        assert_eq!(&payload[..4], &PROTOCOL_VERSION.to_le_bytes());
        assert_eq!(payload[22], 3);

        let decoded: ServerHello = decode_message(&payload).unwrap();
        assert_eq!(decoded, sample_hello());
    }

    #[test]
    fn test_client_hello_auth_roundtrip() {
        let hello = ClientHelloAuth {
            build: PROTOCOL_VERSION,
            account: "player@example.com".to_string(),
            token: [7; 16],
            language: 2,
        };
        let decoded: ClientHelloAuth = decode_message(&encode_message(&hello)).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn test_truncated_message() {
        let payload = encode_message(&ClientHeartbeat { timestamp: 99 });
        let result: ReadResult<ClientHeartbeat> = decode_message(&payload[..5]);
        assert!(matches!(result, Err(ReadError::UnexpectedEnd { .. })));
    }

    #[test]
    fn test_connection_type_fits_field() {
        for kind in [ConnectionType::Auth, ConnectionType::World] {
            assert!(kind.wire_value() < 1 << ConnectionType::BITS);
            assert_eq!(ConnectionType::from_wire_value(kind.wire_value()), Some(kind));
        }
        assert_eq!(ConnectionType::from_wire_value(0), None);
    }
}
