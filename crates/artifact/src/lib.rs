//! Backup artifacts: where they live, how they are produced, and who may
//! touch them while they are being written.
//!
//! The [`ArtifactProducer`] runs an external dump command through a
//! [`DumpStrategy`] and captures its standard output into a file while
//! reporting progress. [`ArtifactStore`] resolves where an artifact lives and
//! [`ArtifactLocks`] keeps a writer from overlapping with readers.

mod lock;
mod params;
mod producer;
mod store;
mod strategy;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

pub use lock::ArtifactLocks;
pub use params::{ConnectionParams, PASSWORD_ENV, Secret};
pub use producer::{ArtifactProducer, partial_path};
pub use store::{ArtifactNaming, ArtifactStore, DEFAULT_ARTIFACT_NAME, validate_backup_id};
pub use strategy::{ContainerDump, DirectDump, DumpStrategy, ShellDump, default_extra_args};

/// Block size used when draining the dump command's output (8 KiB).
pub const DRAIN_BLOCK_SIZE: usize = 8 * 1024;

/// Interval between progress reports while a dump is running.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Delay before the first progress report.
pub const PROGRESS_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// A completed backup file on server storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Reads size and creation time of the file at `path`.
    ///
    /// Filesystems without a birth time report the modification time.
    pub async fn stat(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        let created = metadata.created().or_else(|_| metadata.modified())?;
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            created_at: DateTime::<Utc>::from(created),
        })
    }
}

/// Errors produced by the artifact crate.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dump command {}: {stderr}", describe_exit(.code))]
    Subprocess { code: Option<i32>, stderr: String },

    #[error("invalid backup id: {0}")]
    InvalidId(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".into(),
    }
}
