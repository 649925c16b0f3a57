use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// This acts as a read deadline: if *nothing* arrives within this window
/// (no pong, no status, no data frame), the connection is considered dead.
/// A dump can run for a long time without progress frames, so this is
/// comfortably larger than the producer's reporting interval.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (16 MiB).
///
/// Must hold one data frame of the largest configurable chunk plus its header.
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default payload size of a single data frame (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest chunk size a server may be configured with.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Timeout for unary request/response operations (`ping`, `health`).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Acknowledgement returned by the liveness ping.
pub const PING_ACK: &str = "pong";

/// Status string returned by the health call when the server is able to
/// accept backup requests.
pub const HEALTH_SERVING: &str = "serving";

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Unary calls
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "health")]
    Health,
    #[serde(rename = "health_response")]
    HealthResponse,

    // Streaming backup call
    #[serde(rename = "get_backup")]
    GetBackup,
    #[serde(rename = "cancel_backup")]
    CancelBackup,
    #[serde(rename = "backup_status")]
    BackupStatus,
    #[serde(rename = "backup_end")]
    BackupEnd,

    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_CANCELLED: i32 = 499;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
pub const WS_ERR_CODE_DUMP_FAILED: i32 = 502;
pub const WS_ERR_CODE_IO: i32 = 503;
