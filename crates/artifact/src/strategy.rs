//! How the dump command is invoked.
//!
//! The producer only needs a [`Command`] whose standard output is the backup
//! byte stream. Each strategy decides how that command is built; the
//! credential always travels through the child's environment.

use std::path::PathBuf;

use tokio::process::Command;

use crate::params::{ConnectionParams, PASSWORD_ENV};

/// Builds the command that writes a backup to its standard output.
pub trait DumpStrategy: Send + Sync + 'static {
    /// Short description for logs. Must not contain secrets.
    fn describe(&self) -> String;

    /// Builds the command for the given connection.
    fn command(&self, params: &ConnectionParams) -> Command;
}

/// Default arguments appended after the connection arguments.
pub fn default_extra_args() -> Vec<String> {
    vec!["--format=custom".into(), "--no-password".into()]
}

// ---------------------------------------------------------------------------
// DirectDump
// ---------------------------------------------------------------------------

/// Runs the dump program directly on the server host.
#[derive(Debug, Clone)]
pub struct DirectDump {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl DirectDump {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: default_extra_args(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

impl DumpStrategy for DirectDump {
    fn describe(&self) -> String {
        self.program.display().to_string()
    }

    fn command(&self, params: &ConnectionParams) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(params.dump_args())
            .args(&self.extra_args)
            .env(PASSWORD_ENV, params.password.expose());
        cmd
    }
}

// ---------------------------------------------------------------------------
// ContainerDump
// ---------------------------------------------------------------------------

/// Runs the dump program inside a container (`docker exec` style).
///
/// The credential is forwarded with `-e NAME` (no value), so the container
/// runtime copies it from its own environment.
///
/// Cancellation kills the local `<runtime> exec` client only. The dump
/// process inside the container keeps running until it notices its closed
/// stdout, which for `pg_dump` is its next write. Its output is discarded
/// with the `.partial` file.
#[derive(Debug, Clone)]
pub struct ContainerDump {
    runtime: PathBuf,
    container: String,
    program: String,
    extra_args: Vec<String>,
}

impl ContainerDump {
    pub fn new(
        runtime: impl Into<PathBuf>,
        container: impl Into<String>,
        program: impl Into<String>,
    ) -> Self {
        Self {
            runtime: runtime.into(),
            container: container.into(),
            program: program.into(),
            extra_args: default_extra_args(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

impl DumpStrategy for ContainerDump {
    fn describe(&self) -> String {
        format!(
            "{} exec {} {}",
            self.runtime.display(),
            self.container,
            self.program
        )
    }

    fn command(&self, params: &ConnectionParams) -> Command {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("exec")
            .arg("-i")
            .arg("-e")
            .arg(PASSWORD_ENV)
            .arg(&self.container)
            .arg(&self.program)
            .args(params.dump_args())
            .args(&self.extra_args)
            .env(PASSWORD_ENV, params.password.expose());
        cmd
    }
}

// ---------------------------------------------------------------------------
// ShellDump
// ---------------------------------------------------------------------------

/// Runs an arbitrary `sh -c` script, for dump tools without `pg_dump`
/// style arguments.
///
/// The connection is exposed through the libpq environment variables
/// (`PGHOST`, `PGPORT`, `PGUSER`, `PGDATABASE`, `PGPASSWORD`).
#[derive(Debug, Clone)]
pub struct ShellDump {
    script: String,
}

impl ShellDump {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl DumpStrategy for ShellDump {
    fn describe(&self) -> String {
        "sh -c <script>".into()
    }

    fn command(&self, params: &ConnectionParams) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.script)
            .env("PGHOST", &params.host)
            .env("PGPORT", params.port.to_string())
            .env("PGUSER", &params.user)
            .env("PGDATABASE", &params.database)
            .env(PASSWORD_ENV, params.password.expose());
        cmd
    }
}
