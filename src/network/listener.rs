//! Gateway listener
//!
//! Binds one socket and runs a fixed number of accept workers over it. Every
//! accepted socket becomes its own [`Connection`] task; the listener only
//! keeps a handle per live connection for introspection and admin commands.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionError, ConnectionHandle, ConnectionId};
use super::dispatch::DispatchRegistry;
use super::ConnectionSettings;
use crate::protocol::WriteMessage;

/// Listener errors
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("At least one accept worker is required")]
    NoWorkers,

    #[error("No live connection {0}")]
    UnknownConnection(ConnectionId),
}

pub type ListenerResult<T> = Result<T, ListenerError>;

type ConnectionMap = Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>;

/// A running gateway listener
pub struct Listener {
    local_addr: SocketAddr,
    connections: ConnectionMap,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Listener {
    /// Bind `bind_addr` and start `accept_workers` accept loops.
    ///
    /// The greeting in `settings` gets the bound port and the current time
    /// stamped into it before the first socket is accepted.
    pub async fn start(
        bind_addr: SocketAddr,
        registry: Arc<DispatchRegistry>,
        mut settings: ConnectionSettings,
        accept_workers: usize,
    ) -> ListenerResult<Self> {
        if accept_workers == 0 {
            return Err(ListenerError::NoWorkers);
        }

        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ListenerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        settings.greeting.listen_port = local_addr.port();
        settings.greeting.startup_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();

        tracing::info!(
            "{:?} gateway listening on {} with {} accept workers, {} handlers",
            settings.connection_type,
            local_addr,
            accept_workers,
            registry.len()
        );

        let listener = Arc::new(listener);
        let settings = Arc::new(settings);
        let connections: ConnectionMap = Arc::new(RwLock::new(HashMap::new()));
        let next_id = Arc::new(AtomicU64::new(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        let workers = (0..accept_workers)
            .map(|worker| {
                let acceptor = AcceptWorker {
                    worker,
                    listener: Arc::clone(&listener),
                    registry: Arc::clone(&registry),
                    settings: Arc::clone(&settings),
                    connections: Arc::clone(&connections),
                    next_id: Arc::clone(&next_id),
                };
                tokio::spawn(acceptor.run(shutdown_tx.subscribe()))
            })
            .collect();

        Ok(Self {
            local_addr,
            connections,
            shutdown_tx,
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port actually bound, which differs from the requested one for port 0
    pub fn port_in_use(&self) -> u16 {
        self.local_addr.port()
    }

    pub async fn active_connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Handles of every live connection
    pub async fn connections(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    async fn handle(&self, id: ConnectionId) -> ListenerResult<ConnectionHandle> {
        self.connections
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ListenerError::UnknownConnection(id))
    }

    /// Queue a message for one connection. A connection whose send queue is
    /// full fails with `QueueFull` instead of making the caller wait.
    pub async fn send_to<M: WriteMessage>(&self, id: ConnectionId, message: &M) -> ListenerResult<()> {
        let handle = self.handle(id).await?;
        handle.try_send(message)?;
        Ok(())
    }

    /// Queue a message for every live connection. Returns how many accepted
    /// it; connections with a full queue are skipped.
    pub async fn broadcast<M: WriteMessage>(&self, message: &M) -> usize {
        let mut delivered = 0;
        for handle in self.connections().await {
            match handle.try_send(message) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(connection = %handle.id(), "Broadcast not delivered: {}", e);
                }
            }
        }
        delivered
    }

    /// Close one connection
    pub async fn close(&self, id: ConnectionId, reason: &str) -> ListenerResult<()> {
        let handle = self.handle(id).await?;
        handle.close(reason)?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Stop accepting and close every live connection
    pub async fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        let _ = self.shutdown_tx.send(());
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }

        let handles = self.connections().await;
        tracing::info!("Listener on {} stopped, closing {} connections", self.local_addr, handles.len());

        for handle in handles {
            let _ = handle.close("server shutting down");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

struct AcceptWorker {
    worker: usize,
    listener: Arc<TcpListener>,
    registry: Arc<DispatchRegistry>,
    settings: Arc<ConnectionSettings>,
    connections: ConnectionMap,
    next_id: Arc<AtomicU64>,
}

impl AcceptWorker {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr).await,
                        Err(e) => {
                            // Usually descriptor exhaustion; back off instead of spinning
                            tracing::error!(worker = self.worker, "Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(worker = self.worker, "Accept worker stopping");
                    break;
                }
            }
        }
    }

    async fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (connection, handle) = Connection::new(
            stream,
            addr,
            id,
            Arc::clone(&self.registry),
            Arc::clone(&self.settings),
        );

        tracing::info!(connection = %id, worker = self.worker, "New connection from {}", addr);
        self.connections.write().await.insert(id, handle.clone());

        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            // Run on its own task so a panicking handler is reported here and
            // the connection is still deregistered
            if let Err(e) = tokio::spawn(connection.run()).await {
                tracing::error!(connection = %id, "Connection task failed: {}", e);
            }

            handle.mark_disconnected();
            connections.write().await.remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NullCipher;
    use crate::protocol::message::ServerHeartbeat;
    use crate::protocol::{parse_header, Opcode, RawPacket, HEADER_SIZE};
    use tokio::io::AsyncReadExt;

    fn plain_settings() -> ConnectionSettings {
        ConnectionSettings {
            cipher: Arc::new(NullCipher),
            ..ConnectionSettings::default()
        }
    }

    async fn wait_for_count(listener: &Listener, expected: usize) {
        for _ in 0..200 {
            if listener.active_connection_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection count never reached {}", expected);
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let result = Listener::start(
            "127.0.0.1:0".parse().unwrap(),
            DispatchRegistry::empty(),
            plain_settings(),
            0,
        )
        .await;
        assert!(matches!(result, Err(ListenerError::NoWorkers)));
    }

    #[tokio::test]
    async fn test_accept_greet_and_stop() {
        let mut listener = Listener::start(
            "127.0.0.1:0".parse().unwrap(),
            DispatchRegistry::empty(),
            plain_settings(),
            2,
        )
        .await
        .unwrap();
        assert_ne!(listener.port_in_use(), 0);
        assert!(listener.is_running());

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut header = [0u8; HEADER_SIZE];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(parse_header(&header).unwrap().opcode, Opcode::ServerHello.as_u16());

        wait_for_count(&listener, 1).await;

        let id = listener.connections().await[0].id();
        listener.send_to(id, &ServerHeartbeat { timestamp: 5 }).await.unwrap();
        assert_eq!(listener.broadcast(&ServerHeartbeat { timestamp: 6 }).await, 1);

        listener.stop().await;
        assert!(!listener.is_running());

        // Greeting remainder plus two heartbeats, then EOF
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 31 + 2 * (HEADER_SIZE + 8));

        wait_for_count(&listener, 0).await;
        assert!(matches!(
            listener.close(id, "again").await,
            Err(ListenerError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_block_others() {
        let mut listener = Listener::start(
            "127.0.0.1:0".parse().unwrap(),
            DispatchRegistry::empty(),
            ConnectionSettings {
                command_queue_size: 1,
                ..plain_settings()
            },
            2,
        )
        .await
        .unwrap();

        // Connects and never reads
        let _stalled = TcpStream::connect(listener.local_addr()).await.unwrap();
        wait_for_count(&listener, 1).await;
        let stalled = listener.connections().await[0].clone();

        // Fill the socket buffers, then the send queue
        let bulk = RawPacket::new(Opcode::ServerHeartbeat.as_u16(), vec![0u8; 256 * 1024]);
        let mut queue_full = false;
        for _ in 0..2000 {
            match stalled.try_send_raw(bulk.clone()) {
                Ok(()) => tokio::time::sleep(Duration::from_millis(1)).await,
                Err(ConnectionError::QueueFull) => {
                    queue_full = true;
                    break;
                }
                Err(e) => panic!("unexpected send error: {}", e),
            }
        }
        assert!(queue_full);
        assert!(matches!(
            listener.send_to(stalled.id(), &ServerHeartbeat { timestamp: 1 }).await,
            Err(ListenerError::Connection(ConnectionError::QueueFull))
        ));

        let mut healthy = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut greeting = [0u8; HEADER_SIZE + 31];
        healthy.read_exact(&mut greeting).await.unwrap();
        wait_for_count(&listener, 2).await;

        let delivered = tokio::time::timeout(
            Duration::from_secs(3),
            listener.broadcast(&ServerHeartbeat { timestamp: 6 }),
        )
        .await
        .unwrap();
        assert_eq!(delivered, 1);

        let mut heartbeat = [0u8; HEADER_SIZE + 8];
        healthy.read_exact(&mut heartbeat).await.unwrap();
        assert_eq!(parse_header(&heartbeat).unwrap().opcode, Opcode::ServerHeartbeat.as_u16());

        tokio::time::timeout(Duration::from_secs(3), listener.stop())
            .await
            .unwrap();

        let mut rest = Vec::new();
        healthy.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // The stalled connection abandons its write and goes away too
        wait_for_count(&listener, 0).await;
        assert!(!stalled.is_connected());
    }
}
