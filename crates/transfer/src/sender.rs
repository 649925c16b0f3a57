//! Reads an artifact in fixed-size blocks and turns it into transfer frames.

use std::path::Path;

use dbfetch_protocol::{BackupStatus, PROGRESS_COMPLETE, TransferFrame, human_size};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::staged::StagedProgress;
use crate::{DEFAULT_CHUNK_SIZE, TransferError, emit};

/// Streams an artifact as status and data frames.
#[derive(Debug, Clone)]
pub struct ChunkedSender {
    chunk_size: usize,
    staged: StagedProgress,
}

impl Default for ChunkedSender {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkedSender {
    /// Creates a sender with the given block size.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] (1 MiB) is used.
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            chunk_size,
            staged: StagedProgress::disabled(),
        }
    }

    /// Configures the synthetic "preparing" phase run by [`stage`](Self::stage).
    pub fn with_staged_progress(mut self, staged: StagedProgress) -> Self {
        self.staged = staged;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Runs the configured staged-progress phase (no-op when disabled).
    pub async fn stage(
        &self,
        sink: &mpsc::Sender<TransferFrame>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        self.staged.run(sink, cancel).await
    }

    /// Streams the file at `path` into `sink` and returns the bytes sent.
    ///
    /// The expected total is the file size at open time. Coarse status
    /// frames are emitted each time another tenth of the total has been
    /// sent; the last frame is a progress-100 status carrying the byte count
    /// and the SHA-256 of everything sent.
    pub async fn send(
        &self,
        path: &Path,
        sink: &mpsc::Sender<TransferFrame>,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut file = tokio::fs::File::open(path).await?;
        let total = file.metadata().await?.len();

        info!(path = %path.display(), bytes = total, "starting backup transfer");
        emit(
            sink,
            cancel,
            TransferFrame::Status(
                BackupStatus::new(format!("Starting backup transfer ({})", human_size(total)), 0)
                    .with_bytes(total),
            ),
        )
        .await?;

        let mut hasher = Sha256::new();
        let mut sent: u64 = 0;
        let mut frames: u64 = 0;

        while sent < total {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let want = (total - sent).min(self.chunk_size as u64) as usize;
            let mut buf = vec![0u8; want];
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                read = read_full(&mut file, &mut buf) => read?,
            };
            if n == 0 {
                warn!(
                    path = %path.display(),
                    sent,
                    expected = total,
                    "artifact ended before its recorded size"
                );
                break;
            }
            buf.truncate(n);
            hasher.update(&buf);

            let before = decile(sent, total);
            emit(sink, cancel, TransferFrame::Data(buf)).await?;
            sent += n as u64;
            frames += 1;
            let after = decile(sent, total);

            if after > before && after < 10 {
                let percent = (after * 10) as i32;
                debug!(percent, sent, "transfer progress");
                emit(
                    sink,
                    cancel,
                    TransferFrame::Status(
                        BackupStatus::new(
                            format!("Transferring: {}% ({} of {})", percent, human_size(sent), human_size(total)),
                            percent,
                        )
                        .with_bytes(sent),
                    ),
                )
                .await?;
            }
        }

        let digest = hex::encode(hasher.finalize());
        emit(
            sink,
            cancel,
            TransferFrame::Status(
                BackupStatus::new(
                    format!("Backup transfer completed: {} sent", human_size(sent)),
                    PROGRESS_COMPLETE,
                )
                .with_bytes(sent)
                .with_sha256(digest.clone()),
            ),
        )
        .await?;

        info!(bytes = sent, frames, sha256 = %digest, "backup transfer completed");
        Ok(sent)
    }
}

/// `floor(sent * 10 / total)`, 0 for an empty artifact.
fn decile(sent: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (sent as u128 * 10 / total as u128) as u64
}

/// Fills `buf` completely unless EOF is reached first.
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
