//! Client-side reassembly of a streamed backup.

use std::path::{Path, PathBuf};

use dbfetch_protocol::{BackupStatus, TransferFrame, human_size};
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::progress::SpeedCalculator;
use crate::{BoxError, TransferError};

/// Received-bytes interval between progress log lines (10 GiB).
pub const DEFAULT_LOG_EVERY: u64 = 10 * 1024 * 1024 * 1024;

/// Callback invoked with every status frame.
pub type StatusCallback = Box<dyn Fn(&BackupStatus) + Send + Sync>;

/// Result of a completed [`StreamConsumer::receive`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub total_bytes: u64,
    /// Whether the last status frame was the completion status.
    pub completed: bool,
    /// Hex SHA-256 of the bytes written.
    pub sha256: String,
}

/// Writes the data frames of a backup stream into a local file.
pub struct StreamConsumer {
    log_every: u64,
    on_status: Option<StatusCallback>,
}

impl Default for StreamConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self {
            log_every: DEFAULT_LOG_EVERY,
            on_status: None,
        }
    }

    /// Sets the received-bytes interval between progress log lines.
    pub fn with_log_every(mut self, bytes: u64) -> Self {
        self.log_every = bytes.max(1);
        self
    }

    /// Registers a callback for status frames.
    pub fn on_status(mut self, callback: StatusCallback) -> Self {
        self.on_status = Some(callback);
        self
    }

    /// Consumes `frames` until the stream ends, writing data to `destination`.
    ///
    /// The destination is created (or truncated) before the first frame is
    /// read. A source error or a local write error aborts the transfer and
    /// leaves the partial file in place.
    pub async fn receive<S, E>(
        &self,
        mut frames: S,
        destination: &Path,
    ) -> Result<TransferOutcome, TransferError>
    where
        S: Stream<Item = Result<TransferFrame, E>> + Unpin,
        E: Into<BoxError>,
    {
        let mut file = tokio::fs::File::create(destination).await?;
        let mut hasher = Sha256::new();
        let mut speed = SpeedCalculator::default();
        let mut total: u64 = 0;
        let mut last_status: Option<BackupStatus> = None;

        while let Some(frame) = frames.next().await {
            match frame.map_err(|e| TransferError::Stream(e.into()))? {
                TransferFrame::Status(status) => {
                    if status.is_failure() {
                        warn!(message = %status.message, "remote reported failure");
                    } else {
                        info!(progress = status.progress, message = %status.message, "backup status");
                    }
                    if let Some(cb) = &self.on_status {
                        cb(&status);
                    }
                    last_status = Some(status);
                }
                TransferFrame::Data(data) => {
                    file.write_all(&data).await?;
                    hasher.update(&data);
                    speed.add_sample(data.len() as u64);

                    let before = total / self.log_every;
                    total += data.len() as u64;
                    if total / self.log_every > before {
                        info!(
                            bytes = total,
                            received = %human_size(total),
                            rate = %format!("{}/s", human_size(speed.bytes_per_second() as u64)),
                            "receiving backup"
                        );
                    }
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let digest = hex::encode(hasher.finalize());

        if let Some(status) = &last_status {
            if status.is_failure() {
                return Err(TransferError::Remote(status.message.clone()));
            }
            if status.is_complete() {
                if let Some(expected) = status.bytes {
                    if expected != total {
                        return Err(TransferError::Incomplete {
                            expected,
                            received: total,
                        });
                    }
                }
                if let Some(expected) = &status.sha256 {
                    if !expected.eq_ignore_ascii_case(&digest) {
                        return Err(TransferError::ChecksumMismatch {
                            expected: expected.clone(),
                            actual: digest,
                        });
                    }
                }
            }
        }

        let completed = last_status.as_ref().is_some_and(|s| s.is_complete());
        info!(
            bytes = total,
            path = %destination.display(),
            completed,
            "backup received"
        );

        Ok(TransferOutcome {
            path: destination.to_path_buf(),
            total_bytes: total,
            completed,
            sha256: digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures_util::stream;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::ChunkedSender;

    type Frames = Vec<Result<TransferFrame, std::io::Error>>;

    fn ok(frames: Vec<TransferFrame>) -> Frames {
        frames.into_iter().map(Ok).collect()
    }

    #[tokio::test]
    async fn round_trip_through_sender() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("backup.dump");
        let data: Vec<u8> = (0..3 * 1024 * 1024 + 123).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let send = tokio::spawn(async move {
            ChunkedSender::new(1024 * 1024)
                .send(&source, &tx, &CancellationToken::new())
                .await
        });

        let frames = stream::poll_fn(move |cx| rx.poll_recv(cx)).map(Ok::<_, std::io::Error>);
        let dest = dir.path().join("restored.dump");
        let outcome = StreamConsumer::new().receive(frames, &dest).await.unwrap();

        assert_eq!(send.await.unwrap().unwrap(), data.len() as u64);
        assert_eq!(outcome.total_bytes, data.len() as u64);
        assert!(outcome.completed);
        assert_eq!(outcome.path, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn status_frames_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.dump");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);

        let frames = ok(vec![
            TransferFrame::status("starting", 0),
            TransferFrame::Data(b"abc".to_vec()),
            TransferFrame::status("halfway", 50),
            TransferFrame::Data(b"def".to_vec()),
            TransferFrame::status("done", 100),
        ]);

        let outcome = StreamConsumer::new()
            .on_status(Box::new(move |status| {
                s.lock().unwrap().push(status.progress);
            }))
            .receive(stream::iter(frames), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdef");
        assert_eq!(outcome.total_bytes, 6);
        assert!(outcome.completed);
        assert_eq!(*seen.lock().unwrap(), vec![0, 50, 100]);
    }

    #[tokio::test]
    async fn truncates_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.dump");
        std::fs::write(&dest, b"old content that is long").unwrap();

        StreamConsumer::new()
            .receive(stream::iter(ok(vec![TransferFrame::Data(b"new".to_vec())])), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[tokio::test]
    async fn stream_without_completion_is_not_completed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.dump");

        let outcome = StreamConsumer::new()
            .receive(stream::iter(ok(vec![TransferFrame::Data(b"x".to_vec())])), &dest)
            .await
            .unwrap();

        assert!(!outcome.completed);
        assert_eq!(outcome.total_bytes, 1);
    }

    #[tokio::test]
    async fn source_error_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.dump");

        let frames: Frames = vec![
            Ok(TransferFrame::Data(b"partial".to_vec())),
            Err(std::io::Error::other("connection reset")),
            Ok(TransferFrame::Data(b"never".to_vec())),
        ];

        let result = StreamConsumer::new().receive(stream::iter(frames), &dest).await;
        match result {
            Err(TransferError::Stream(e)) => assert!(e.to_string().contains("connection reset")),
            other => panic!("expected stream error, got {other:?}"),
        }
        assert_eq!(std::fs::read(&dest).unwrap(), b"partial");
    }

    #[tokio::test]
    async fn unwritable_destination_fails_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing-dir/out.dump");

        let result = StreamConsumer::new()
            .receive(stream::iter(ok(vec![TransferFrame::Data(b"x".to_vec())])), &dest)
            .await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn remote_failure_status() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.dump");

        let result = StreamConsumer::new()
            .receive(
                stream::iter(ok(vec![
                    TransferFrame::status("Dumping", 0),
                    TransferFrame::failed("Backup failed: connection refused"),
                ])),
                &dest,
            )
            .await;

        match result {
            Err(TransferError::Remote(msg)) => assert!(msg.contains("connection refused")),
            other => panic!("expected remote failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn byte_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.dump");

        let result = StreamConsumer::new()
            .receive(
                stream::iter(ok(vec![
                    TransferFrame::Data(b"abc".to_vec()),
                    TransferFrame::Status(BackupStatus::new("done", 100).with_bytes(10)),
                ])),
                &dest,
            )
            .await;

        assert!(matches!(
            result,
            Err(TransferError::Incomplete {
                expected: 10,
                received: 3
            })
        ));
    }

    #[tokio::test]
    async fn checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.dump");

        let result = StreamConsumer::new()
            .receive(
                stream::iter(ok(vec![
                    TransferFrame::Data(b"abc".to_vec()),
                    TransferFrame::Status(
                        BackupStatus::new("done", 100)
                            .with_bytes(3)
                            .with_sha256("00".repeat(32)),
                    ),
                ])),
                &dest,
            )
            .await;

        assert!(matches!(result, Err(TransferError::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn small_log_interval_does_not_affect_output() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.dump");
        let frames = ok((0..10).map(|i| TransferFrame::Data(vec![i; 100])).collect());

        let outcome = StreamConsumer::new()
            .with_log_every(250)
            .receive(stream::iter(frames), &dest)
            .await
            .unwrap();

        assert_eq!(outcome.total_bytes, 1000);
    }
}
