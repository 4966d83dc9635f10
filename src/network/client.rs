//! Probe client
//!
//! Speaks the gateway protocol from the client side: reads the greeting,
//! arms encryption with the seed matching the announced connection type,
//! then exchanges framed packets. Used by the `probe` command and tests.

use bytes::BytesMut;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::crypto::{CipherError, KeySeeds, KeyState, PacketCipher};
use crate::protocol::message::{decode_message, encode_message, ServerHello};
use crate::protocol::{
    encode_packet, extract_packets, ConnectionType, FrameError, Opcode, RawPacket, ReadError,
    ReadMessage, WriteMessage,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed by server")]
    Closed,

    #[error("Expected opcode 0x{expected:04X}, got 0x{actual:04X}")]
    UnexpectedOpcode { expected: u16, actual: u16 },

    #[error("Unknown connection type {0} in greeting")]
    UnknownConnectionType(u8),

    #[error("Decode error: {0}")]
    Decode(#[from] ReadError),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A connected probe
pub struct ProbeClient {
    stream: TcpStream,
    server_addr: SocketAddr,
    greeting: ServerHello,
    connection_type: ConnectionType,
    cipher: Arc<dyn PacketCipher>,
    key: KeyState,
    read_buf: BytesMut,
    /// Packets extracted but not yet handed out
    pending: VecDeque<RawPacket>,
}

impl ProbeClient {
    /// Connect and complete the greeting
    pub async fn connect(
        server_addr: SocketAddr,
        timeout: Duration,
        cipher: Arc<dyn PacketCipher>,
        seeds: KeySeeds,
    ) -> ClientResult<Self> {
        tracing::info!("Connecting to {}", server_addr);

        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(server_addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let mut read_buf = BytesMut::with_capacity(4096);
        let mut pending = VecDeque::new();

        // The greeting is the only packet that is never encrypted
        let packet = tokio::time::timeout(
            timeout,
            next_packet(&mut stream, &mut read_buf, &mut pending),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        if packet.opcode != Opcode::ServerHello.as_u16() {
            return Err(ClientError::UnexpectedOpcode {
                expected: Opcode::ServerHello.as_u16(),
                actual: packet.opcode,
            });
        }

        let greeting: ServerHello = decode_message(&packet.payload)?;
        let connection_type = ConnectionType::from_wire_value(u64::from(greeting.connection_type))
            .ok_or(ClientError::UnknownConnectionType(greeting.connection_type))?;
        let key = cipher.derive_key(seeds.for_connection(connection_type));

        tracing::debug!(
            "Greeting from {}: version {}, {:?}",
            server_addr,
            greeting.auth_version,
            connection_type
        );

        Ok(Self {
            stream,
            server_addr,
            greeting,
            connection_type,
            cipher,
            key,
            read_buf,
            pending,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// The server's greeting
    pub fn greeting(&self) -> &ServerHello {
        &self.greeting
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    /// Encrypt and send a message
    pub async fn send<M: WriteMessage>(&mut self, message: &M) -> ClientResult<()> {
        let payload = encode_message(message);
        self.send_raw(M::OPCODE.as_u16(), &payload).await
    }

    /// Encrypt and send an arbitrary payload under any opcode, known or not
    pub async fn send_raw(&mut self, opcode: u16, payload: &[u8]) -> ClientResult<()> {
        let encrypted = self.cipher.encrypt(payload, &mut self.key);
        let mut frame = BytesMut::new();
        encode_packet(opcode, &encrypted, &mut frame)?;
        self.send_bytes(&frame).await
    }

    /// Write bytes verbatim, bypassing framing and encryption
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> ClientResult<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive and decrypt the next packet
    pub async fn recv(&mut self) -> ClientResult<RawPacket> {
        let packet = self.next_packet().await?;
        let payload = self.cipher.decrypt(&packet.payload, &mut self.key)?;
        Ok(RawPacket::new(packet.opcode, payload))
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> ClientResult<RawPacket> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Receive the next packet and decode it as `M`
    pub async fn recv_message<M: ReadMessage>(&mut self) -> ClientResult<M> {
        let packet = self.recv().await?;
        if packet.opcode != M::OPCODE.as_u16() {
            return Err(ClientError::UnexpectedOpcode {
                expected: M::OPCODE.as_u16(),
                actual: packet.opcode,
            });
        }
        Ok(decode_message(&packet.payload)?)
    }

    /// Shut down the write half and wait for the server to close
    pub async fn close(mut self) -> ClientResult<()> {
        self.stream.shutdown().await?;
        let mut sink = Vec::new();
        self.stream.read_to_end(&mut sink).await?;
        Ok(())
    }

    async fn next_packet(&mut self) -> ClientResult<RawPacket> {
        next_packet(&mut self.stream, &mut self.read_buf, &mut self.pending).await
    }
}

async fn next_packet(
    stream: &mut TcpStream,
    read_buf: &mut BytesMut,
    pending: &mut VecDeque<RawPacket>,
) -> ClientResult<RawPacket> {
    loop {
        if let Some(packet) = pending.pop_front() {
            return Ok(packet);
        }

        if stream.read_buf(read_buf).await? == 0 {
            return Err(ClientError::Closed);
        }
        pending.extend(extract_packets(read_buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NullCipher;

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let result = ProbeClient::connect(
            addr,
            Duration::from_secs(2),
            Arc::new(NullCipher),
            KeySeeds::default(),
        )
        .await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
