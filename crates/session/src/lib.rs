//! One `get_backup` call, from request validation to the last frame.
//!
//! ```text
//! Init -> EnsureArtifact -> StagedProgress -> Transfer -> Done
//!   \___________\________________\______________\-----> Failed
//! ```
//!
//! Every frame goes to the per-call sink handed to [`TransferSession::run`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use dbfetch_artifact::{Artifact, ArtifactError, ArtifactLocks, ArtifactProducer, ArtifactStore};
use dbfetch_protocol::{
    BackupStatus, FailureKind, GetBackupRequest, TransferFrame, human_size,
};
use dbfetch_transfer::{ChunkedSender, TransferError, emit};
use tokio::sync::{OwnedRwLockReadGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session states, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    EnsureArtifact,
    StagedProgress,
    Transfer,
    Done,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::EnsureArtifact => "ensure_artifact",
            Self::StagedProgress => "staged_progress",
            Self::Transfer => "transfer",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl SessionError {
    /// Coarse category reported to the caller.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::Artifact(e) => match e {
                ArtifactError::Cancelled => FailureKind::Cancelled,
                ArtifactError::Spawn { .. } | ArtifactError::Subprocess { .. } => {
                    FailureKind::Subprocess
                }
                ArtifactError::Io(_) => FailureKind::Io,
                ArtifactError::InvalidId(_) => FailureKind::InvalidRequest,
                ArtifactError::Internal(_) => FailureKind::Unexpected,
            },
            Self::Transfer(e) => match e {
                // A closed sink means the connection is gone.
                TransferError::Cancelled | TransferError::SinkClosed => FailureKind::Cancelled,
                TransferError::Io(_) => FailureKind::Io,
                _ => FailureKind::Unexpected,
            },
        }
    }

    /// Wire error code for [`kind`](Self::kind).
    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == FailureKind::Cancelled
    }

    /// Whether a terminal failure status was already emitted at the failure
    /// site.
    pub fn already_reported(&self) -> bool {
        matches!(self, Self::Artifact(ArtifactError::Subprocess { .. }))
    }
}

/// Per-server session settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Regenerate the artifact on every call instead of reusing one that
    /// already exists.
    pub always_regenerate: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            always_regenerate: true,
        }
    }
}

/// Runs `get_backup` calls against one artifact store.
///
/// Cheap to share: clone the `Arc`s or wrap the session itself in one.
pub struct TransferSession {
    store: ArtifactStore,
    producer: Arc<ArtifactProducer>,
    sender: ChunkedSender,
    locks: ArtifactLocks,
    config: SessionConfig,
}

impl TransferSession {
    pub fn new(
        store: ArtifactStore,
        producer: Arc<ArtifactProducer>,
        sender: ChunkedSender,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            producer,
            sender,
            locks: ArtifactLocks::default(),
            config,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Runs one call and returns the number of artifact bytes streamed.
    ///
    /// On failure, a best-effort terminal status (progress `-1`) is sent
    /// unless the failure site already sent one or the call was cancelled.
    pub async fn run(
        &self,
        request: &GetBackupRequest,
        sink: &mpsc::Sender<TransferFrame>,
        cancel: &CancellationToken,
    ) -> Result<u64, SessionError> {
        let backup_id = request.backup_id.as_str();
        match self.run_states(backup_id, sink, cancel).await {
            Ok(sent) => {
                info!(backup_id, state = %SessionState::Done, bytes = sent, "backup session finished");
                Ok(sent)
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!(backup_id, state = %SessionState::Failed, "backup session cancelled");
                } else {
                    warn!(
                        backup_id,
                        state = %SessionState::Failed,
                        code = e.code(),
                        "backup session failed: {e}"
                    );
                    if !e.already_reported() {
                        let _ = emit(
                            sink,
                            cancel,
                            TransferFrame::failed(format!("Backup failed: {e}")),
                        )
                        .await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_states(
        &self,
        backup_id: &str,
        sink: &mpsc::Sender<TransferFrame>,
        cancel: &CancellationToken,
    ) -> Result<u64, SessionError> {
        debug!(backup_id, state = %SessionState::Init, "backup session");
        if backup_id.trim().is_empty() {
            return Err(SessionError::InvalidRequest("backup id is empty".into()));
        }
        let path = self.store.path_for(backup_id).map_err(|e| match e {
            ArtifactError::InvalidId(reason) => SessionError::InvalidRequest(reason),
            other => other.into(),
        })?;

        debug!(backup_id, state = %SessionState::EnsureArtifact, path = %path.display(), "backup session");
        let (artifact, _read_guard) = self.ensure_artifact(backup_id, &path, sink, cancel).await?;

        debug!(backup_id, state = %SessionState::StagedProgress, "backup session");
        self.sender.stage(sink, cancel).await?;

        debug!(backup_id, state = %SessionState::Transfer, bytes = artifact.size, "backup session");
        let sent = self.sender.send(&artifact.path, sink, cancel).await?;
        Ok(sent)
    }
}

impl TransferSession {
    /// Returns a complete artifact for `path` together with the shared lock
    /// that keeps writers out while it is streamed.
    ///
    /// In reuse mode an existing artifact is served under the shared lock
    /// alone, so concurrent calls stream it side by side. Production takes
    /// the exclusive lock, checks again for an artifact a concurrent call
    /// may have just produced, and downgrades once the file is complete.
    async fn ensure_artifact(
        &self,
        backup_id: &str,
        path: &Path,
        sink: &mpsc::Sender<TransferFrame>,
        cancel: &CancellationToken,
    ) -> Result<(Artifact, OwnedRwLockReadGuard<()>), SessionError> {
        if !self.config.always_regenerate {
            let read_guard = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
                guard = self.locks.read(path) => guard,
            };
            if let Some(artifact) = self.store.existing(path).await? {
                self.announce_reuse(backup_id, &artifact, sink, cancel).await?;
                return Ok((artifact, read_guard));
            }
        }

        let write_guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
            guard = self.locks.write(path) => guard,
        };

        let existing = if self.config.always_regenerate {
            None
        } else {
            self.store.existing(path).await?
        };
        let artifact = match existing {
            Some(artifact) => {
                self.announce_reuse(backup_id, &artifact, sink, cancel).await?;
                artifact
            }
            None => self.producer.produce(path, sink, cancel).await?,
        };

        Ok((artifact, write_guard.downgrade()))
    }

    async fn announce_reuse(
        &self,
        backup_id: &str,
        artifact: &Artifact,
        sink: &mpsc::Sender<TransferFrame>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        info!(backup_id, path = %artifact.path.display(), bytes = artifact.size, "reusing existing artifact");
        emit(
            sink,
            cancel,
            TransferFrame::Status(
                BackupStatus::new(
                    format!("Using existing backup ({})", human_size(artifact.size)),
                    0,
                )
                .with_bytes(artifact.size),
            ),
        )
        .await
    }
}
