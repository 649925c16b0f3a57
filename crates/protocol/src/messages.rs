use serde::{Deserialize, Serialize};

/// Progress value reserved for terminal failure.
pub const PROGRESS_FAILED: i32 = -1;

/// Progress value of the final, successful status.
pub const PROGRESS_COMPLETE: i32 = 100;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Requests a backup to be produced (or reused) and streamed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetBackupRequest {
    pub backup_id: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Reply to `ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongResponse {
    pub ack: String,
}

/// Reply to `health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

// ---------------------------------------------------------------------------
// Streamed payloads
// ---------------------------------------------------------------------------

/// A human-readable progress report interleaved with data frames.
///
/// `progress` is a percentage in `0..=100`, or [`PROGRESS_FAILED`] for a
/// terminal failure. Values are not required to increase strictly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub message: String,
    pub progress: i32,
    /// Byte count the message refers to (written so far, total size or
    /// total sent, depending on the phase).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Hex SHA-256 of everything sent; only present on the final status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl BackupStatus {
    pub fn new(message: impl Into<String>, progress: i32) -> Self {
        Self {
            message: message.into(),
            progress,
            bytes: None,
            sha256: None,
        }
    }

    /// Terminal failure status.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(message, PROGRESS_FAILED)
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }

    pub fn is_failure(&self) -> bool {
        self.progress == PROGRESS_FAILED
    }

    pub fn is_complete(&self) -> bool {
        self.progress == PROGRESS_COMPLETE
    }
}
