//! Backup WebSocket server.
//!
//! Listens on a TCP port, upgrades connections to WebSocket, and serves any
//! number of clients concurrently.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use dbfetch_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection::{self, ClientConnection, ConnectionMeta};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

/// The backup WebSocket server.
///
/// Dispatches messages from every connected client to the provided
/// [`Handler`].
pub struct BackupServer<H: Handler> {
    addr: SocketAddr,
    handler: Arc<H>,
    connections: Mutex<HashMap<u64, ClientConnection>>,
    next_conn_id: AtomicU64,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> BackupServer<H> {
    /// Creates a new server with the given handler.
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Self::with_handler(config, Arc::new(handler))
    }

    /// Creates a new server sharing an existing handler.
    pub fn with_handler(config: ServerConfig, handler: Arc<H>) -> Arc<Self> {
        Arc::new(Self {
            addr: SocketAddr::new(config.host, config.port),
            handler,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of live client connections.
    pub async fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .filter(|c| c.sender().is_connected())
            .count()
    }

    /// Number of streaming calls in flight across all connections.
    pub async fn active_calls(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .map(|c| c.active_calls())
            .sum()
    }

    /// Returns a token cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Gracefully shuts down the server, cancelling every call.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("backup server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.close_all().await;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn close_all(&self) {
        let conns: Vec<ClientConnection> =
            self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for conn in &conns {
            conn.close();
        }
        for conn in &conns {
            conn.closed().await;
        }
    }

    /// Handles a single TCP connection: upgrades to WS and tracks it until
    /// the client goes away.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(conn_id, %peer_addr, "WebSocket connection established");

        let meta = ConnectionMeta {
            conn_id,
            remote_addr: peer_addr.to_string(),
        };
        let conn = connection::spawn_connection(
            ws_stream,
            meta,
            Arc::clone(&self.handler),
            &self.cancel,
        );
        let finished = {
            let mut conns = self.connections.lock().await;
            let finished = conn.finished_token();
            conns.insert(conn_id, conn);
            finished
        };

        finished.cancelled().await;
        self.connections.lock().await.remove(&conn_id);
        Ok(())
    }
}
