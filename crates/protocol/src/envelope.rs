//! Text-frame envelope shared by every call.
//!
//! `id` ties replies to the call that caused them. A unary call gets exactly
//! one reply carrying its id. A `get_backup` call gets `backup_status`
//! messages and data frames under its id, then either `backup_end` or
//! `error`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants::MessageType;

/// Body of an `error` message. `code` maps onto a `FailureKind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsError {
    pub code: i32,
    pub message: String,
}

/// Why a payload could not be read.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("missing payload")]
    Missing,
    #[error("invalid payload: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// One text message on the wire: `{id, type, payload?, error?}`.
///
/// The payload stays raw JSON until the receiver knows which type the
/// message kind carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let payload = payload.map(serde_json::value::to_raw_value).transpose()?;
        Ok(Self {
            id: id.into(),
            msg_type,
            payload,
            error: None,
        })
    }

    /// A message that is only its type, such as `backup_end`,
    /// `cancel_backup` or an argument-less `ping`.
    pub fn signal(id: impl Into<String>, msg_type: MessageType) -> Self {
        Self {
            id: id.into(),
            msg_type,
            payload: None,
            error: None,
        }
    }

    /// Decodes the payload, if there is one.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }

    /// Decodes a payload the message kind cannot do without.
    pub fn require_payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        self.parse_payload()?.ok_or(PayloadError::Missing)
    }

    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(WsError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Reply to this call under the same id.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Message::new(&self.id, msg_type, payload)
    }

    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(&self.id, code, message)
    }
}
