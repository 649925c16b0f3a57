//! Coarse failure categories carried by the terminating `error` message.

use crate::constants::{
    WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CANCELLED, WS_ERR_CODE_DUMP_FAILED, WS_ERR_CODE_INTERNAL,
    WS_ERR_CODE_IO, WS_ERR_CODE_NOT_IMPLEMENTED,
};

/// Category of a failed call, as seen by the remote caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The caller withdrew the request.
    Cancelled,
    /// The dump command exited non-zero.
    Subprocess,
    /// A file could not be created, read or written.
    Io,
    /// The request itself was malformed.
    InvalidRequest,
    /// The server does not implement the requested call.
    NotImplemented,
    /// Anything else.
    Unexpected,
}

impl FailureKind {
    /// Wire error code for this category.
    pub fn code(self) -> i32 {
        match self {
            Self::Cancelled => WS_ERR_CODE_CANCELLED,
            Self::Subprocess => WS_ERR_CODE_DUMP_FAILED,
            Self::Io => WS_ERR_CODE_IO,
            Self::InvalidRequest => WS_ERR_CODE_BAD_REQUEST,
            Self::NotImplemented => WS_ERR_CODE_NOT_IMPLEMENTED,
            Self::Unexpected => WS_ERR_CODE_INTERNAL,
        }
    }

    /// Maps a wire error code back to its category.
    ///
    /// Unknown codes are reported as [`FailureKind::Unexpected`].
    pub fn from_code(code: i32) -> Self {
        match code {
            WS_ERR_CODE_CANCELLED => Self::Cancelled,
            WS_ERR_CODE_DUMP_FAILED => Self::Subprocess,
            WS_ERR_CODE_IO => Self::Io,
            WS_ERR_CODE_BAD_REQUEST => Self::InvalidRequest,
            WS_ERR_CODE_NOT_IMPLEMENTED => Self::NotImplemented,
            _ => Self::Unexpected,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cancelled => "cancelled",
            Self::Subprocess => "dump failed",
            Self::Io => "i/o failure",
            Self::InvalidRequest => "invalid request",
            Self::NotImplemented => "not implemented",
            Self::Unexpected => "unexpected failure",
        };
        f.write_str(s)
    }
}
