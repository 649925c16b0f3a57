pub mod constants;
pub mod envelope;
pub mod failure;
pub mod frame;
pub mod messages;
pub mod size;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, PayloadError, WsError};
pub use failure::FailureKind;
pub use frame::{DataFrameHeader, ParseError, TransferFrame, encode_data_frame, parse_data_frame};
pub use messages::{
    BackupStatus, GetBackupRequest, HealthResponse, PROGRESS_COMPLETE, PROGRESS_FAILED,
    PongResponse,
};
pub use size::human_size;
