//! Per-client connection
//!
//! Each accepted socket is driven by one task that owns all of its state:
//! - the inbound byte buffer and packet reassembly
//! - the encryption key state
//! - the lifecycle state machine
//! - the opaque session blob handlers work with
//!
//! Other tasks talk to a connection only through its [`ConnectionHandle`].
//!
//! ```text
//! Connected -> Authenticating -> Authenticated -> Disconnected
//!     (greeting sent)   (handler marked auth)
//! ```

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::dispatch::{Access, DispatchRegistry, HandlerContext, HandlerError};
use super::session::Session;
use super::ConnectionSettings;
use crate::crypto::{CipherError, KeyState};
use crate::protocol::message::encode_message;
use crate::protocol::{
    encode_packet, extract_packets, pending_header, FrameError, Opcode, RawPacket, ReadError,
    WriteMessage,
};

/// Connection errors. All of them end the connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to decode opcode 0x{opcode:04X}: {source}")]
    Decode {
        opcode: u16,
        #[source]
        source: ReadError,
    },

    #[error("Declared packet size {size} is below the header minimum")]
    MalformedHeader { size: u32 },

    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connection closed")]
    Closed,

    #[error("Send channel closed")]
    SendChannelClosed,

    #[error("Send queue full")]
    QueueFull,

    #[error("Closed while writing: {0}")]
    Interrupted(String),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Listener-assigned connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, greeting not yet sent
    Connected,
    /// Greeting sent, waiting for the client's credentials
    Authenticating,
    /// Handshake complete
    Authenticated,
    /// Terminal
    Disconnected,
}

/// Why a connection ended without an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its side of the socket
    PeerClosed,
    /// A handler or an administrative command asked for the close
    Requested(String),
    /// No inbound bytes within the configured idle timeout
    IdleTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed the connection"),
            DisconnectReason::Requested(reason) => write!(f, "closed: {}", reason),
            DisconnectReason::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Packets sent
    pub packets_sent: u64,
    /// Packets received, including discarded ones
    pub packets_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Packets dropped for an unregistered opcode or missing handler
    pub packets_discarded: u64,
    /// Handler invocations that reported a failure
    pub handler_failures: u64,
}

/// Requests delivered to a connection task from elsewhere
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Encode-free send of an already built payload
    Send(RawPacket),
}

/// A handle for talking to a connection from another task.
///
/// Sends are queued on a bounded channel. Closing bypasses that queue, so a
/// connection stuck writing to a peer that stopped reading can still be shut
/// down.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    sender: mpsc::Sender<ConnectionCommand>,
    close_tx: Arc<watch::Sender<Option<String>>>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, sender: mpsc::Sender<ConnectionCommand>) -> Self {
        let (close_tx, _) = watch::channel(None);
        Self {
            id,
            peer_addr,
            sender,
            close_tx: Arc::new(close_tx),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    fn close_signal(&self) -> watch::Receiver<Option<String>> {
        self.close_tx.subscribe()
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send a message through this connection
    pub async fn send<M: WriteMessage>(&self, message: &M) -> ConnectionResult<()> {
        self.send_raw(RawPacket::new(M::OPCODE.as_u16(), encode_message(message)))
            .await
    }

    /// Send an encoded payload through this connection
    pub async fn send_raw(&self, packet: RawPacket) -> ConnectionResult<()> {
        self.command(ConnectionCommand::Send(packet)).await
    }

    /// Queue a message without waiting. Fails with `QueueFull` when the
    /// connection is not keeping up.
    pub fn try_send<M: WriteMessage>(&self, message: &M) -> ConnectionResult<()> {
        self.try_send_raw(RawPacket::new(M::OPCODE.as_u16(), encode_message(message)))
    }

    pub fn try_send_raw(&self, packet: RawPacket) -> ConnectionResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }

        self.sender
            .try_send(ConnectionCommand::Send(packet))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ConnectionError::SendChannelClosed,
            })
    }

    /// Ask the connection to close. Never waits. Packets already queued are
    /// written first, but a write blocked on a peer that stopped reading is
    /// abandoned.
    pub fn close(&self, reason: impl Into<String>) -> ConnectionResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }

        self.close_tx.send_replace(Some(reason.into()));
        Ok(())
    }

    async fn command(&self, command: ConnectionCommand) -> ConnectionResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }

        self.sender
            .send(command)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

enum Event {
    Read(io::Result<usize>),
    Command(ConnectionCommand),
    Close(String),
    IdleTimeout,
}

/// A live client connection over any byte stream
pub struct Connection<S> {
    id: ConnectionId,
    peer_addr: SocketAddr,
    stream: S,
    state: ConnectionState,
    /// Bytes received but not yet resolved into packets
    read_buf: BytesMut,
    write_buf: BytesMut,
    key: KeyState,
    encryption_active: bool,
    session: Session,
    registry: Arc<DispatchRegistry>,
    settings: Arc<ConnectionSettings>,
    handle: ConnectionHandle,
    commands: mpsc::Receiver<ConnectionCommand>,
    close_rx: watch::Receiver<Option<String>>,
    last_activity: Instant,
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an accepted stream. The connection does nothing until [`run`]
    /// is awaited.
    ///
    /// [`run`]: Connection::run
    pub fn new(
        stream: S,
        peer_addr: SocketAddr,
        id: ConnectionId,
        registry: Arc<DispatchRegistry>,
        settings: Arc<ConnectionSettings>,
    ) -> (Self, ConnectionHandle) {
        let (sender, commands) = mpsc::channel(settings.command_queue_size.max(1));
        let handle = ConnectionHandle::new(id, peer_addr, sender);

        let connection = Self {
            id,
            peer_addr,
            stream,
            state: ConnectionState::Connected,
            read_buf: BytesMut::with_capacity(settings.read_buffer_size),
            write_buf: BytesMut::with_capacity(settings.read_buffer_size),
            key: settings.cipher.derive_key(settings.key_seed),
            encryption_active: false,
            session: Session::new(),
            registry,
            settings,
            close_rx: handle.close_signal(),
            handle: handle.clone(),
            commands,
            last_activity: Instant::now(),
            stats: ConnectionStats::default(),
        };

        (connection, handle)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Drive the connection until it ends. Consumes the connection, so the
    /// buffer, key state and session are released on return whatever the
    /// outcome.
    pub async fn run(mut self) -> ConnectionResult<ConnectionStats> {
        let outcome = self.drive().await;

        self.state = ConnectionState::Disconnected;
        self.handle.mark_disconnected();
        let _ = self.stream.shutdown().await;

        match outcome {
            Ok(reason) => {
                tracing::info!(
                    connection = %self.id,
                    peer = %self.peer_addr,
                    packets_in = self.stats.packets_received,
                    packets_out = self.stats.packets_sent,
                    "Connection ended: {}",
                    reason
                );
                Ok(self.stats)
            }
            Err(e) => {
                // The client gets no wire-level explanation, only the server log
                tracing::warn!(
                    connection = %self.id,
                    peer = %self.peer_addr,
                    packets_in = self.stats.packets_received,
                    packets_out = self.stats.packets_sent,
                    "Connection dropped: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> ConnectionResult<DisconnectReason> {
        self.greet().await?;

        loop {
            let deadline = self
                .settings
                .idle_timeout
                .map(|timeout| self.last_activity + timeout);

            if self.read_buf.capacity() - self.read_buf.len() < self.settings.read_buffer_size {
                self.read_buf.reserve(self.settings.read_buffer_size);
            }

            // Sends queued before a close still go out
            let event = tokio::select! {
                biased;
                Some(command) = self.commands.recv() => Event::Command(command),
                Ok(()) = self.close_rx.changed() => Event::Close(requested_close(&self.close_rx)),
                result = self.stream.read_buf(&mut self.read_buf) => Event::Read(result),
                _ = idle_expired(deadline) => Event::IdleTimeout,
            };

            match event {
                Event::Read(Ok(0)) => return Ok(DisconnectReason::PeerClosed),
                Event::Read(Ok(n)) => {
                    self.stats.bytes_received += n as u64;
                    self.last_activity = Instant::now();

                    if let Some(reason) = self.process_inbound().await? {
                        return Ok(DisconnectReason::Requested(reason));
                    }
                }
                Event::Read(Err(e)) => return Err(ConnectionError::Io(e)),
                Event::Command(ConnectionCommand::Send(packet)) => {
                    self.send_packet(packet.opcode, &packet.payload).await?;
                }
                Event::Close(reason) => return Ok(DisconnectReason::Requested(reason)),
                Event::IdleTimeout => return Ok(DisconnectReason::IdleTimeout),
            }
        }
    }

    /// Send the greeting and arm encryption
    async fn greet(&mut self) -> ConnectionResult<()> {
        let greeting = self.settings.greeting.clone();
        self.send(&greeting).await?;

        self.state = ConnectionState::Authenticating;
        self.encryption_active = true;

        tracing::debug!(connection = %self.id, peer = %self.peer_addr, "Greeting sent");
        Ok(())
    }

    /// Dispatch every complete packet in the buffer, in arrival order.
    /// Returns a close reason if a handler asked for one.
    async fn process_inbound(&mut self) -> ConnectionResult<Option<String>> {
        for packet in extract_packets(&mut self.read_buf) {
            self.stats.packets_received += 1;

            if let Some(reason) = self.dispatch(packet).await? {
                return Ok(Some(reason));
            }
        }

        // Nothing in the stream marks where the next packet starts, so a bad
        // size field cannot be skipped over
        if let Some(header) = pending_header(&self.read_buf) {
            match header.payload_len() {
                None => return Err(ConnectionError::MalformedHeader { size: header.size }),
                Some(len) if len > self.settings.max_packet_size => {
                    return Err(ConnectionError::PacketTooLarge {
                        size: len,
                        max: self.settings.max_packet_size,
                    });
                }
                Some(_) => {}
            }
        }

        Ok(None)
    }

    async fn dispatch(&mut self, packet: RawPacket) -> ConnectionResult<Option<String>> {
        let payload = if self.encryption_active {
            Bytes::from(self.settings.cipher.decrypt(&packet.payload, &mut self.key)?)
        } else {
            packet.payload
        };

        let Some(opcode) = Opcode::from_u16(packet.opcode) else {
            tracing::debug!(
                connection = %self.id,
                "Discarding unknown opcode 0x{:04X} ({} bytes)",
                packet.opcode,
                payload.len()
            );
            self.stats.packets_discarded += 1;
            return Ok(None);
        };

        let registry = Arc::clone(&self.registry);
        let Some(route) = registry.route(opcode) else {
            tracing::debug!(connection = %self.id, "No handler for {}", opcode);
            self.stats.packets_discarded += 1;
            return Ok(None);
        };

        if route.access == Access::Authenticated && self.state != ConnectionState::Authenticated {
            tracing::warn!(
                connection = %self.id,
                state = ?self.state,
                "Dropping {} received before authentication",
                opcode
            );
            self.stats.packets_discarded += 1;
            return Ok(None);
        }

        tracing::trace!(connection = %self.id, "Dispatching {} ({} bytes)", opcode, payload.len());

        let mut ctx = HandlerContext::new(
            self.id,
            self.peer_addr,
            self.state,
            &mut self.session,
            &self.handle,
        );
        let result = route.handler.handle(payload, &mut ctx).await;
        let effects = ctx.into_effects();

        let result = match result {
            Err(HandlerError::Decode(source)) => {
                return Err(ConnectionError::Decode {
                    opcode: packet.opcode,
                    source,
                });
            }
            other => other,
        };

        for reply in effects.outbound {
            self.send_packet(reply.opcode, &reply.payload).await?;
        }

        match result {
            Ok(()) => {
                if effects.authenticated && self.state == ConnectionState::Authenticating {
                    self.state = ConnectionState::Authenticated;
                    tracing::info!(
                        connection = %self.id,
                        peer = %self.peer_addr,
                        "Handshake complete"
                    );
                }
            }
            Err(e) => {
                self.stats.handler_failures += 1;
                tracing::warn!(connection = %self.id, "Handler for {} failed: {}", opcode, e);
            }
        }

        Ok(effects.close_reason)
    }

    /// Send a message
    pub async fn send<M: WriteMessage>(&mut self, message: &M) -> ConnectionResult<()> {
        let payload = encode_message(message);
        self.send_packet(M::OPCODE.as_u16(), &payload).await
    }

    async fn send_packet(&mut self, opcode: u16, payload: &[u8]) -> ConnectionResult<()> {
        self.write_buf.clear();

        if self.encryption_active {
            let encrypted = self.settings.cipher.encrypt(payload, &mut self.key);
            encode_packet(opcode, &encrypted, &mut self.write_buf)?;
        } else {
            encode_packet(opcode, payload, &mut self.write_buf)?;
        }

        // A peer that stops reading parks the write; a close request still
        // gets through
        let stream = &mut self.stream;
        let close_rx = &mut self.close_rx;
        tokio::select! {
            result = write_frame(stream, &self.write_buf) => result?,
            Ok(()) = close_rx.changed() => {
                return Err(ConnectionError::Interrupted(requested_close(close_rx)));
            }
        }

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        Ok(())
    }
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &[u8]) -> io::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await
}

fn requested_close(close_rx: &watch::Receiver<Option<String>>) -> String {
    close_rx.borrow().clone().unwrap_or_default()
}

async fn idle_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
