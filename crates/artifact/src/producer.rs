//! Artifact production: runs the dump command and captures its output.
//!
//! Three tasks cooperate per run:
//! - the drain loop copies the child's stdout into the artifact file in
//!   [`DRAIN_BLOCK_SIZE`] blocks and bumps a shared byte counter;
//! - the progress loop reads that counter on a timer and emits status frames;
//! - a stderr collector buffers diagnostics for the failure report.
//!
//! The counter is the only state shared between the drain and progress loops.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dbfetch_protocol::{BackupStatus, TransferFrame, human_size};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::params::ConnectionParams;
use crate::strategy::DumpStrategy;
use crate::{
    Artifact, ArtifactError, DRAIN_BLOCK_SIZE, PROGRESS_INITIAL_DELAY, PROGRESS_INTERVAL,
};

/// Produces backup artifacts by running a dump command.
pub struct ArtifactProducer {
    strategy: Arc<dyn DumpStrategy>,
    params: ConnectionParams,
    block_size: usize,
    initial_delay: Duration,
    interval: Duration,
    remove_partial_on_failure: bool,
}

impl ArtifactProducer {
    pub fn new(strategy: Arc<dyn DumpStrategy>, params: ConnectionParams) -> Self {
        Self {
            strategy,
            params,
            block_size: DRAIN_BLOCK_SIZE,
            initial_delay: PROGRESS_INITIAL_DELAY,
            interval: PROGRESS_INTERVAL,
            remove_partial_on_failure: false,
        }
    }

    /// Overrides the progress cadence (first report after `initial_delay`,
    /// then every `interval`).
    pub fn with_progress_interval(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.interval = interval;
        self
    }

    /// Deletes the partially written file when the dump command fails.
    ///
    /// Off by default: the `.partial` file is kept for diagnosis.
    pub fn with_remove_partial_on_failure(mut self, remove: bool) -> Self {
        self.remove_partial_on_failure = remove;
        self
    }

    /// Runs the dump command and writes its output to `target`.
    ///
    /// Any previous file at `target` is removed first. Output goes to
    /// [`partial_path`] and is renamed onto `target` only after the command
    /// exits 0, so `target` never holds an incomplete dump. Status frames are
    /// sent on `progress` while the dump runs. On a non-zero exit a terminal
    /// failure status (progress `-1`) carrying the captured stderr is sent
    /// before the error is returned. On cancellation the child is killed
    /// and no further frames are sent.
    pub async fn produce(
        &self,
        target: &Path,
        progress: &mpsc::Sender<TransferFrame>,
        cancel: &CancellationToken,
    ) -> Result<Artifact, ArtifactError> {
        if cancel.is_cancelled() {
            return Err(ArtifactError::Cancelled);
        }

        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        if remove_if_present(target).await? {
            info!(path = %target.display(), "removed previous artifact");
        }
        let partial = partial_path(target);
        remove_if_present(&partial).await?;

        let file = tokio::fs::File::create(&partial).await?;

        let description = self.strategy.describe();
        let mut command = self.strategy.command(&self.params);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            command = %description,
            host = %self.params.host,
            database = %self.params.database,
            path = %partial.display(),
            "starting dump"
        );

        let mut child = command.spawn().map_err(|source| ArtifactError::Spawn {
            program: description.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ArtifactError::Internal("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ArtifactError::Internal("child stderr not captured".into()))?;

        let written = Arc::new(AtomicU64::new(0));
        let drain_task = tokio::spawn(drain_to_file(
            stdout,
            file,
            Arc::clone(&written),
            self.block_size,
        ));
        let stderr_task = tokio::spawn(collect_stderr(stderr));

        let settled = CancellationToken::new();
        let progress_task = tokio::spawn(report_progress(
            Arc::clone(&written),
            progress.clone(),
            settled.clone(),
            cancel.clone(),
            self.initial_delay,
            self.interval,
        ));

        let outcome = wait_for_dump(&mut child, drain_task, cancel).await;

        // The progress loop must be gone before anything else is emitted.
        settled.cancel();
        let _ = progress_task.await;

        let (status, drained) = match outcome {
            Ok(done) => done,
            Err(e) => {
                stderr_task.abort();
                return Err(e);
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let code = status.code();
            let stderr = stderr.trim().to_string();
            warn!(?code, bytes = drained, path = %partial.display(), "dump command failed");

            let reason = if stderr.is_empty() {
                match code {
                    Some(code) => format!("dump command exited with code {code}"),
                    None => "dump command was terminated by a signal".to_string(),
                }
            } else {
                stderr.clone()
            };

            if self.remove_partial_on_failure {
                if let Err(e) = tokio::fs::remove_file(&partial).await {
                    warn!(path = %partial.display(), "failed to remove partial artifact: {e}");
                }
            }

            let failed = TransferFrame::failed(format!("Backup failed: {reason}"));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ArtifactError::Cancelled),
                _ = progress.send(failed) => {}
            }

            return Err(ArtifactError::Subprocess { code, stderr });
        }

        tokio::fs::rename(&partial, target).await?;
        let artifact = Artifact::stat(target).await?;
        if artifact.size != drained {
            warn!(
                drained,
                size = artifact.size,
                "artifact size differs from drained byte count"
            );
        }

        info!(
            bytes = artifact.size,
            path = %artifact.path.display(),
            "dump completed"
        );

        let status = BackupStatus::new(
            format!("Backup created: {}", human_size(artifact.size)),
            0,
        )
        .with_bytes(artifact.size);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ArtifactError::Cancelled),
            _ = progress.send(TransferFrame::Status(status)) => {}
        }

        Ok(artifact)
    }
}

/// Waits until the child has exited and the drain loop has copied every
/// byte, killing the child on cancellation or on a drain failure.
async fn wait_for_dump(
    child: &mut Child,
    mut drain_task: JoinHandle<std::io::Result<u64>>,
    cancel: &CancellationToken,
) -> Result<(ExitStatus, u64), ArtifactError> {
    let mut status: Option<ExitStatus> = None;
    let mut drained: Option<u64> = None;

    loop {
        if let (Some(status), Some(drained)) = (status, drained) {
            return Ok((status, drained));
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                warn!("dump cancelled, killing subprocess");
                kill(child).await;
                drain_task.abort();
                return Err(ArtifactError::Cancelled);
            }

            joined = &mut drain_task, if drained.is_none() => {
                match joined {
                    Ok(Ok(n)) => {
                        debug!(bytes = n, "drain loop finished");
                        drained = Some(n);
                    }
                    Ok(Err(e)) => {
                        kill(child).await;
                        return Err(e.into());
                    }
                    Err(e) => {
                        kill(child).await;
                        return Err(ArtifactError::Internal(format!("drain task failed: {e}")));
                    }
                }
            }

            exited = child.wait(), if status.is_none() => {
                let exited = exited?;
                debug!(?exited, "dump process exited");
                status = Some(exited);
            }
        }
    }
}

/// Sibling path a dump is written to before it is complete:
/// `backup.dump` becomes `backup.dump.partial`.
pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(OsString::from).unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

/// Removes `path`, returning whether a file was there.
async fn remove_if_present(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("failed to kill dump process: {e}");
    }
}

/// Copies `source` into `file` and syncs it to disk.
async fn drain_to_file<R>(
    source: R,
    mut file: tokio::fs::File,
    written: Arc<AtomicU64>,
    block_size: usize,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let total = drain(source, &mut file, &written, block_size).await?;
    file.sync_all().await?;
    Ok(total)
}

/// Copies `source` into `sink` block by block, publishing the running total
/// in `written` after every write.
async fn drain<R, W>(
    mut source: R,
    sink: &mut W,
    written: &AtomicU64,
    block_size: usize,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; block_size];
    let mut total: u64 = 0;

    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await?;
        total += n as u64;
        written.fetch_add(n as u64, Ordering::Relaxed);
    }

    sink.flush().await?;
    Ok(total)
}

async fn collect_stderr<R: AsyncRead + Unpin>(mut stderr: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buf).await {
        debug!("stderr read error: {e}");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Emits the byte counter on a timer until `settled` or `cancel` fires.
async fn report_progress(
    written: Arc<AtomicU64>,
    sink: mpsc::Sender<TransferFrame>,
    settled: CancellationToken,
    cancel: CancellationToken,
    initial_delay: Duration,
    interval: Duration,
) {
    tokio::select! {
        _ = settled.cancelled() => return,
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(initial_delay) => {}
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = settled.cancelled() => break,
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let bytes = written.load(Ordering::Relaxed);
        let status = BackupStatus::new(
            format!("Dumping database: {} written", human_size(bytes)),
            0,
        )
        .with_bytes(bytes);

        tokio::select! {
            biased;
            _ = settled.cancelled() => break,
            _ = cancel.cancelled() => break,
            sent = sink.send(TransferFrame::Status(status)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}
