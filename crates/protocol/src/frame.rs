//! Transfer frames and the binary data-frame codec.
//!
//! Status frames travel as JSON `backup_status` messages. Data frames travel
//! as binary WebSocket messages:
//!
//! ```text
//! [4 bytes: header_len (big-endian)][header_len bytes: JSON header][rest: payload]
//! ```
//!
//! The header carries the id of the `get_backup` call the payload belongs to.

use serde::{Deserialize, Serialize};

use crate::messages::BackupStatus;

/// One unit of the interleaved outbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferFrame {
    Status(BackupStatus),
    /// Artifact bytes; never empty.
    Data(Vec<u8>),
}

impl TransferFrame {
    pub fn status(message: impl Into<String>, progress: i32) -> Self {
        Self::Status(BackupStatus::new(message, progress))
    }

    /// Terminal failure status (progress `-1`).
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Status(BackupStatus::failed(message))
    }

    pub fn as_status(&self) -> Option<&BackupStatus> {
        match self {
            Self::Status(s) => Some(s),
            Self::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(d) => Some(d),
            Self::Status(_) => None,
        }
    }
}

/// Header for binary data frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrameHeader {
    pub id: String,
}

/// Encodes a data frame for sending over WebSocket.
pub fn encode_data_frame(id: &str, payload: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let header = DataFrameHeader { id: id.to_string() };
    let header_json = serde_json::to_vec(&header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parses a raw binary WebSocket frame into its header and payload.
pub fn parse_data_frame(data: &[u8]) -> Result<(DataFrameHeader, Vec<u8>), ParseError> {
    if data.len() < 4 {
        return Err(ParseError::TooShort);
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if data.len() - 4 < header_len {
        return Err(ParseError::HeaderTruncated {
            expected: header_len,
            got: data.len() - 4,
        });
    }

    let header_bytes = &data[4..4 + header_len];
    let header: DataFrameHeader =
        serde_json::from_slice(header_bytes).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let payload = data[4 + header_len..].to_vec();
    if payload.is_empty() {
        return Err(ParseError::EmptyPayload);
    }

    Ok((header, payload))
}

/// Errors from binary frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),

    #[error("data frame without payload")]
    EmptyPayload,
}
