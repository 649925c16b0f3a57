//! Agent configuration management.
//!
//! Configuration is stored as TOML, by default at
//! `~/.config/dbfetch/agent.toml`. A missing file is created with defaults.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use dbfetch_artifact::{
    ArtifactNaming, ArtifactStore, ConnectionParams, ContainerDump, DirectDump, DumpStrategy,
    Secret, ShellDump, default_extra_args,
};
use dbfetch_protocol::constants::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use dbfetch_transfer::{DEFAULT_STAGE_STEPS, StagedProgress};
use serde::{Deserialize, Serialize};

/// Upper bound for `staged_steps`.
const MAX_STAGED_STEPS: u32 = 1000;

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the WebSocket server binds.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding backup artifacts (created if missing).
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Artifact file name when one file serves every backup id.
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,

    /// Store one artifact per backup id (`<id>.dump`) instead of a single
    /// well-known file.
    #[serde(default)]
    pub per_backup_artifacts: bool,

    /// Regenerate the artifact on every call; when false an existing file
    /// is reused.
    #[serde(default = "default_true")]
    pub always_regenerate: bool,

    /// Data frame size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Checkpoints of the "preparing" phase before streaming (0 = off).
    #[serde(default = "default_staged_steps")]
    pub staged_steps: u32,

    /// Delay between "preparing" checkpoints in milliseconds.
    #[serde(default = "default_staged_delay_ms")]
    pub staged_delay_ms: u64,

    /// Delete the partial artifact when the dump command fails.
    #[serde(default)]
    pub remove_partial_on_failure: bool,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub dump: DumpConfig,
}

/// Connection settings for the database being dumped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default = "default_db_user")]
    pub user: String,

    #[serde(default = "default_db_name")]
    pub name: String,

    /// Inline credential. Prefer `password_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable holding the credential; takes precedence over
    /// `password` when set in the environment.
    #[serde(
        default = "default_password_env",
        skip_serializing_if = "Option::is_none"
    )]
    pub password_env: Option<String>,
}

/// How the dump command is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpMode {
    /// Run `program` on this host.
    #[default]
    Direct,
    /// Run `program` inside `container` through `runtime exec`.
    Container,
    /// Run `script` with `sh -c`.
    Shell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpConfig {
    #[serde(default)]
    pub mode: DumpMode,

    #[serde(default = "default_dump_program")]
    pub program: String,

    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default)]
    pub container: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    #[serde(default = "default_extra_args")]
    pub extra_args: Vec<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    7420
}

fn default_storage_dir() -> PathBuf {
    home_dir().join(".local").join("share").join("dbfetch").join("backups")
}

fn default_artifact_name() -> String {
    dbfetch_artifact::DEFAULT_ARTIFACT_NAME.into()
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_staged_steps() -> u32 {
    DEFAULT_STAGE_STEPS
}

fn default_staged_delay_ms() -> u64 {
    1000
}

fn default_db_host() -> String {
    "localhost".into()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_user() -> String {
    "postgres".into()
}

fn default_db_name() -> String {
    "postgres".into()
}

fn default_password_env() -> Option<String> {
    Some("DBFETCH_DB_PASSWORD".into())
}

fn default_dump_program() -> String {
    "pg_dump".into()
}

fn default_runtime() -> String {
    "docker".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            name: default_db_name(),
            password: None,
            password_env: default_password_env(),
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            mode: DumpMode::default(),
            program: default_dump_program(),
            runtime: default_runtime(),
            container: String::new(),
            script: None,
            extra_args: default_extra_args(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            storage_dir: default_storage_dir(),
            artifact_name: default_artifact_name(),
            per_backup_artifacts: false,
            always_regenerate: default_true(),
            chunk_size: default_chunk_size(),
            staged_steps: default_staged_steps(),
            staged_delay_ms: default_staged_delay_ms(),
            remove_partial_on_failure: false,
            database: DatabaseConfig::default(),
            dump: DumpConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or creates a default file there if
    /// it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "created default configuration");
            config
        };
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // May hold a credential.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Rejects settings the agent cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE} bytes, got {}",
                self.chunk_size
            );
        }
        if self.staged_steps > MAX_STAGED_STEPS {
            bail!(
                "staged_steps must be at most {MAX_STAGED_STEPS}, got {}",
                self.staged_steps
            );
        }
        if !self.per_backup_artifacts && self.artifact_name.trim().is_empty() {
            bail!("artifact_name must not be empty");
        }
        match self.dump.mode {
            DumpMode::Direct if self.dump.program.is_empty() => {
                bail!("dump.program must be set for direct mode")
            }
            DumpMode::Container if self.dump.container.is_empty() => {
                bail!("dump.container must be set for container mode")
            }
            DumpMode::Shell if self.dump.script.as_deref().is_none_or(str::is_empty) => {
                bail!("dump.script must be set for shell mode")
            }
            _ => Ok(()),
        }
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        let naming = if self.per_backup_artifacts {
            ArtifactNaming::PerBackupId {
                extension: "dump".into(),
            }
        } else {
            ArtifactNaming::Fixed(self.artifact_name.clone())
        };
        ArtifactStore::new(&self.storage_dir, naming)
    }

    pub fn dump_strategy(&self) -> Arc<dyn DumpStrategy> {
        let dump = &self.dump;
        match dump.mode {
            DumpMode::Direct => Arc::new(
                DirectDump::new(&dump.program).with_extra_args(dump.extra_args.clone()),
            ),
            DumpMode::Container => Arc::new(
                ContainerDump::new(&dump.runtime, &dump.container, &dump.program)
                    .with_extra_args(dump.extra_args.clone()),
            ),
            DumpMode::Shell => Arc::new(ShellDump::new(dump.script.clone().unwrap_or_default())),
        }
    }

    /// Connection parameters, with the credential resolved from the
    /// environment when configured.
    pub fn connection_params(&self) -> ConnectionParams {
        let db = &self.database;
        let from_env = db
            .password_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        let password = from_env.or_else(|| db.password.clone()).unwrap_or_default();

        ConnectionParams {
            host: db.host.clone(),
            port: db.port,
            user: db.user.clone(),
            database: db.name.clone(),
            password: Secret::new(password),
        }
    }

    pub fn staged_progress(&self) -> StagedProgress {
        StagedProgress {
            steps: self.staged_steps,
            delay: Duration::from_millis(self.staged_delay_ms),
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    home_dir().join(".config").join("dbfetch").join("agent.toml")
}
