//! Client for the dbfetch backup server.
//!
//! [`BackupClient`] keeps one WebSocket connection open, correlates unary
//! replies by request id and routes each `get_backup` call's frames into its
//! own [`BackupStream`].

mod pumps;
mod routes;
mod stream;
mod ws_client;

pub use stream::BackupStream;
pub use ws_client::BackupClient;

use dbfetch_protocol::{FailureKind, PayloadError};
use dbfetch_transfer::TransferError;
use tokio_tungstenite::tungstenite;

/// Errors from the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("protocol error: {0}")]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl ClientError {
    /// Failure category of a server-reported error.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Server { code, .. } => Some(FailureKind::from_code(*code)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "request timed out");
        assert_eq!(ClientError::Closed.to_string(), "connection closed");

        let err = ClientError::Server {
            code: 502,
            message: "dump command exited with code 1".into(),
        };
        assert!(err.to_string().contains("502"));
        assert_eq!(err.failure_kind(), Some(FailureKind::Subprocess));
        assert_eq!(ClientError::Closed.failure_kind(), None);
    }
}
