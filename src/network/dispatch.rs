//! Dispatch registry
//!
//! Maps opcodes to handlers. The table is assembled once with a
//! [`DispatchBuilder`] before the listener starts and is then shared
//! read-only by every connection, so lookups take no lock.
//!
//! # Example
//!
//! ```ignore
//! use gatehouse::network::{DispatchRegistry, HandlerContext, HandlerResult};
//! use gatehouse::protocol::message::{ClientHeartbeat, ServerHeartbeat};
//!
//! let registry = DispatchRegistry::builder()
//!     .on_authenticated(|ping: ClientHeartbeat, ctx: &mut HandlerContext<'_>| {
//!         ctx.send(&ServerHeartbeat { timestamp: ping.timestamp });
//!         Ok(())
//!     })?
//!     .build();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use super::connection::{ConnectionHandle, ConnectionId, ConnectionState};
use super::session::Session;
use crate::protocol::message::{decode_message, encode_message};
use crate::protocol::{Opcode, RawPacket, ReadError, ReadMessage, WriteMessage};

/// Registry construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Handler already registered for {0}")]
    DuplicateHandler(Opcode),
}

/// Failure reported by a handler
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The payload did not decode. Fatal for the connection.
    #[error("Decode error: {0}")]
    Decode(#[from] ReadError),

    /// The handler rejected the message. Logged, the connection carries on.
    #[error("Handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Connection state a handler requires before it is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Any live state, including the handshake
    Any,
    /// Only after a handler has marked the connection authenticated
    Authenticated,
}

/// View of the connection handed to a handler.
///
/// Packets queued with [`HandlerContext::send`] are written in order once
/// the handler returns, before the next inbound packet is looked at.
pub struct HandlerContext<'a> {
    connection_id: ConnectionId,
    peer_addr: SocketAddr,
    state: ConnectionState,
    session: &'a mut Session,
    handle: &'a ConnectionHandle,
    outbound: Vec<RawPacket>,
    authenticated: bool,
    close_reason: Option<String>,
}

/// What a handler asked the connection to do
#[derive(Debug, Default)]
pub(crate) struct HandlerEffects {
    pub outbound: Vec<RawPacket>,
    pub authenticated: bool,
    pub close_reason: Option<String>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
        state: ConnectionState,
        session: &'a mut Session,
        handle: &'a ConnectionHandle,
    ) -> Self {
        Self {
            connection_id,
            peer_addr,
            state,
            session,
            handle,
            outbound: Vec::new(),
            authenticated: false,
            close_reason: None,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// State at the time the packet was dispatched
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &*self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut *self.session
    }

    /// Handle for sending to this connection later, from another task
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Queue a message for this connection
    pub fn send<M: WriteMessage>(&mut self, message: &M) {
        self.outbound
            .push(RawPacket::new(M::OPCODE.as_u16(), encode_message(message)));
    }

    /// Queue an already encoded payload
    pub fn send_raw(&mut self, opcode: Opcode, payload: impl Into<Bytes>) {
        self.outbound.push(RawPacket::new(opcode.as_u16(), payload));
    }

    /// Move the connection from `Authenticating` to `Authenticated` once this
    /// handler returns successfully
    pub fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// Close the connection after queued packets are written
    pub fn close(&mut self, reason: impl Into<String>) {
        self.close_reason = Some(reason.into());
    }

    pub(crate) fn into_effects(self) -> HandlerEffects {
        HandlerEffects {
            outbound: self.outbound,
            authenticated: self.authenticated,
            close_reason: self.close_reason,
        }
    }
}

/// A message handler
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one decrypted payload
    async fn handle(&self, payload: Bytes, ctx: &mut HandlerContext<'_>) -> HandlerResult;
}

/// Decodes the payload into `M` before calling a plain function
struct MessageHandler<M, F> {
    handler: F,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, F> Handler for MessageHandler<M, F>
where
    M: ReadMessage + Send + 'static,
    F: Fn(M, &mut HandlerContext<'_>) -> HandlerResult + Send + Sync + 'static,
{
    async fn handle(&self, payload: Bytes, ctx: &mut HandlerContext<'_>) -> HandlerResult {
        let message = decode_message::<M>(&payload)?;
        (self.handler)(message, ctx)
    }
}

pub(crate) struct Route {
    pub handler: Box<dyn Handler>,
    pub access: Access,
}

/// Immutable opcode -> handler table
pub struct DispatchRegistry {
    routes: HashMap<Opcode, Route>,
}

impl DispatchRegistry {
    pub fn builder() -> DispatchBuilder {
        DispatchBuilder::default()
    }

    /// Registry with no handlers; every packet is discarded
    pub fn empty() -> Arc<Self> {
        DispatchBuilder::default().build()
    }

    pub(crate) fn route(&self, opcode: Opcode) -> Option<&Route> {
        self.routes.get(&opcode)
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.routes.contains_key(&opcode)
    }

    pub fn access(&self, opcode: Opcode) -> Option<Access> {
        self.routes.get(&opcode).map(|route| route.access)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered opcodes in wire order
    pub fn opcodes(&self) -> Vec<Opcode> {
        let mut opcodes: Vec<Opcode> = self.routes.keys().copied().collect();
        opcodes.sort_unstable();
        opcodes
    }
}

impl fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("opcodes", &self.opcodes())
            .finish()
    }
}

/// Collects registrations, then freezes them into a [`DispatchRegistry`]
#[derive(Default)]
pub struct DispatchBuilder {
    routes: HashMap<Opcode, Route>,
}

impl DispatchBuilder {
    /// Register a handler implementation for an opcode
    pub fn register<H>(mut self, opcode: Opcode, access: Access, handler: H) -> Result<Self, DispatchError>
    where
        H: Handler + 'static,
    {
        if self.routes.contains_key(&opcode) {
            return Err(DispatchError::DuplicateHandler(opcode));
        }

        self.routes.insert(
            opcode,
            Route {
                handler: Box::new(handler),
                access,
            },
        );
        Ok(self)
    }

    /// Register a function taking the decoded message, callable in any state
    pub fn on<M, F>(self, handler: F) -> Result<Self, DispatchError>
    where
        M: ReadMessage + Send + 'static,
        F: Fn(M, &mut HandlerContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_message(Access::Any, handler)
    }

    /// Register a function taking the decoded message, only invoked once the
    /// connection is authenticated
    pub fn on_authenticated<M, F>(self, handler: F) -> Result<Self, DispatchError>
    where
        M: ReadMessage + Send + 'static,
        F: Fn(M, &mut HandlerContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_message(Access::Authenticated, handler)
    }

    fn register_message<M, F>(self, access: Access, handler: F) -> Result<Self, DispatchError>
    where
        M: ReadMessage + Send + 'static,
        F: Fn(M, &mut HandlerContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(
            M::OPCODE,
            access,
            MessageHandler {
                handler,
                _message: PhantomData,
            },
        )
    }

    pub fn build(self) -> Arc<DispatchRegistry> {
        Arc::new(DispatchRegistry {
            routes: self.routes,
        })
    }
}
