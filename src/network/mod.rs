//! Network module - Handles the TCP side of the gateway
//!
//! Provides:
//! - Listener for accepting client sockets
//! - Per-connection actor driving framing, encryption and dispatch
//! - Dispatch registry handlers plug into
//! - Probe client for talking to a gateway

mod client;
mod connection;
mod dispatch;
mod listener;
mod session;

pub use client::*;
pub use connection::*;
pub use dispatch::{
    Access, DispatchBuilder, DispatchError, DispatchRegistry, Handler, HandlerContext,
    HandlerError, HandlerResult,
};
pub use listener::*;
pub use session::Session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::{default_cipher, KeySeeds, PacketCipher};
use crate::protocol::message::ServerHello;
use crate::protocol::{ConnectionType, DEFAULT_PORT, PROTOCOL_VERSION};

/// Default per-read buffer growth
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Default cap on a single inbound payload
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Default depth of a connection's command queue
pub const DEFAULT_COMMAND_QUEUE_SIZE: usize = 256;

/// Settings shared by every connection a listener accepts
#[derive(Clone)]
pub struct ConnectionSettings {
    /// Service this listener fronts
    pub connection_type: ConnectionType,
    /// Greeting sent on accept. The listener fills in port and startup time.
    pub greeting: ServerHello,
    /// Encryption collaborator
    pub cipher: Arc<dyn PacketCipher>,
    /// Seed for the per-connection key state
    pub key_seed: u64,
    /// Largest inbound payload accepted before the connection is dropped
    pub max_packet_size: usize,
    pub read_buffer_size: usize,
    /// Close connections that stay silent this long
    pub idle_timeout: Option<Duration>,
    pub command_queue_size: usize,
}

impl ConnectionSettings {
    pub fn new(connection_type: ConnectionType, cipher: Arc<dyn PacketCipher>, seeds: KeySeeds) -> Self {
        Self {
            connection_type,
            greeting: ServerHello {
                connection_type: connection_type.wire_value() as u8,
                ..default_greeting()
            },
            cipher,
            key_seed: seeds.for_connection(connection_type),
            ..Self::default()
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Auth,
            greeting: default_greeting(),
            cipher: default_cipher(true),
            key_seed: KeySeeds::default().auth,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            idle_timeout: None,
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
        }
    }
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("connection_type", &self.connection_type)
            .field("greeting", &self.greeting)
            .field("max_packet_size", &self.max_packet_size)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("idle_timeout", &self.idle_timeout)
            .field("command_queue_size", &self.command_queue_size)
            .finish_non_exhaustive()
    }
}

fn default_greeting() -> ServerHello {
    ServerHello {
        auth_version: PROTOCOL_VERSION,
        realm_id: 0,
        realm_group_id: 0,
        startup_time: 0,
        listen_port: DEFAULT_PORT,
        connection_type: ConnectionType::Auth.wire_value() as u8,
        network_message_crc: 0,
        process_id: std::process::id(),
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
