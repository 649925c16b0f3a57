//! Chunked streaming of a backup artifact and its reassembly on the client.
//!
//! The server side reads the artifact with [`ChunkedSender`] and pushes
//! [`TransferFrame`]s into a bounded channel; the client side feeds the
//! received frames to [`StreamConsumer`], which rebuilds the file.

mod consumer;
mod progress;
mod sender;
mod staged;

use dbfetch_protocol::TransferFrame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use consumer::{DEFAULT_LOG_EVERY, StatusCallback, StreamConsumer, TransferOutcome};
pub use dbfetch_protocol::constants::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use progress::SpeedCalculator;
pub use sender::ChunkedSender;
pub use staged::{DEFAULT_STAGE_DELAY, DEFAULT_STAGE_STEPS, StagedProgress};

/// Boxed error reported by a frame source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("frame sink closed")]
    SinkClosed,

    #[error("stream error: {0}")]
    Stream(#[source] BoxError),

    #[error("remote failure: {0}")]
    Remote(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("incomplete transfer: expected {expected} bytes, received {received}")]
    Incomplete { expected: u64, received: u64 },
}

/// Sends `frame` unless `cancel` fires first.
///
/// Cancellation is checked before the send and while waiting for channel
/// capacity, so nothing is enqueued once the token is cancelled.
pub async fn emit(
    sink: &mpsc::Sender<TransferFrame>,
    cancel: &CancellationToken,
    frame: TransferFrame,
) -> Result<(), TransferError> {
    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        sent = sink.send(frame) => sent.map_err(|_| TransferError::SinkClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_delivers_frame() {
        let (tx, mut rx) = mpsc::channel(1);
        emit(&tx, &CancellationToken::new(), TransferFrame::status("hi", 0))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), TransferFrame::status("hi", 0));
    }

    #[tokio::test]
    async fn emit_refuses_after_cancel() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = emit(&tx, &cancel, TransferFrame::status("hi", 0)).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_unblocks_on_cancel_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        emit(&tx, &cancel, TransferFrame::status("first", 0))
            .await
            .unwrap();

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            c.cancel();
        });

        let result = emit(&tx, &cancel, TransferFrame::status("second", 0)).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn emit_reports_closed_sink() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = emit(&tx, &CancellationToken::new(), TransferFrame::Data(vec![1])).await;
        assert!(matches!(result, Err(TransferError::SinkClosed)));
    }
}
