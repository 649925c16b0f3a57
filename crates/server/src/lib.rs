//! WebSocket server for dbfetch.
//!
//! Accepts any number of client connections, dispatches JSON messages to a
//! [`Handler`], and manages each connection's lifecycle (ping/pong, per-call
//! cancellation, graceful shutdown). Streaming calls run as their own tasks
//! so a `cancel_backup` can reach them while they are in flight.

mod calls;
mod connection;
mod handler;
mod server;

pub use calls::CallRegistry;
pub use connection::{ClientConnection, ConnectionMeta, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{BackupServer, ServerConfig};

/// Send buffer capacity per connection.
///
/// Data frames wait for capacity instead of being dropped, so this bounds
/// the memory held by queued chunks (capacity times the chunk size).
pub const SEND_BUFFER_SIZE: usize = 64;

/// Errors produced by the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
