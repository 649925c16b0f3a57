//! `fetch-backup`: downloads a backup from a dbfetch agent.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use dbfetch_client::BackupClient;
use dbfetch_protocol::human_size;
use dbfetch_transfer::{DEFAULT_LOG_EVERY, StreamConsumer};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Agent address.
    #[arg(short, long, default_value = "ws://127.0.0.1:7420", global = true)]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the agent answers.
    Ping,
    /// Ask the agent for its serving status.
    Health,
    /// Download a backup.
    Get(GetArgs),
}

#[derive(Args, Debug)]
struct GetArgs {
    /// Backup identifier.
    backup_id: String,

    /// Output file.
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// Log received bytes every N MiB.
    #[arg(long, value_name = "MIB")]
    log_every_mib: Option<u64>,
}

impl GetArgs {
    fn log_every(&self) -> u64 {
        match self.log_every_mib {
            Some(0) => u64::MAX,
            Some(mib) => mib.saturating_mul(1024 * 1024),
            None => DEFAULT_LOG_EVERY,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = BackupClient::connect(&cli.url)
        .await
        .with_context(|| format!("connecting to {}", cli.url))?;

    let result = match &cli.command {
        Command::Ping => client.ping().await.map(|pong| {
            println!("{}", pong.ack);
        }),
        Command::Health => client.health().await.map(|health| {
            println!("{}", health.status);
        }),
        Command::Get(args) => {
            let result = tokio::select! {
                result = fetch(&client, args) => result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted, cancelling backup");
                    Err(anyhow::anyhow!("interrupted"))
                }
            };
            client.close().await;
            return result;
        }
    };

    client.close().await;
    result.map_err(Into::into)
}

async fn fetch(client: &BackupClient, args: &GetArgs) -> anyhow::Result<()> {
    let consumer = StreamConsumer::new()
        .with_log_every(args.log_every())
        .on_status(Box::new(|status| {
            if status.is_failure() {
                eprintln!("[fail] {}", status.message);
            } else {
                eprintln!("[{:>3}%] {}", status.progress, status.message);
            }
        }));

    let started = Instant::now();
    let outcome = client
        .fetch_backup(&args.backup_id, &args.output, &consumer)
        .await
        .with_context(|| format!("fetching backup {}", args.backup_id))?;

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        bytes = outcome.total_bytes,
        completed = outcome.completed,
        sha256 = %outcome.sha256,
        "received {} in {elapsed:.1}s",
        human_size(outcome.total_bytes)
    );
    if !outcome.completed {
        anyhow::bail!(
            "stream ended before the agent reported completion; {} is partial",
            display(&outcome.path)
        );
    }
    println!("{}", display(&outcome.path));
    Ok(())
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_get_command() {
        let cli = Cli::try_parse_from([
            "fetch-backup",
            "--url",
            "ws://db-host:9000",
            "get",
            "nightly",
            "-o",
            "/tmp/nightly.dump",
            "--log-every-mib",
            "5",
        ])
        .unwrap();

        assert_eq!(cli.url, "ws://db-host:9000");
        let Command::Get(args) = cli.command else {
            panic!("expected get");
        };
        assert_eq!(args.backup_id, "nightly");
        assert_eq!(args.output, PathBuf::from("/tmp/nightly.dump"));
        assert_eq!(args.log_every(), 5 * 1024 * 1024);
    }

    #[test]
    fn get_requires_output() {
        assert!(Cli::try_parse_from(["fetch-backup", "get", "nightly"]).is_err());
    }

    #[test]
    fn log_every_defaults_and_zero() {
        let cli = Cli::try_parse_from(["fetch-backup", "get", "x", "-o", "out"]).unwrap();
        let Command::Get(args) = cli.command else {
            panic!("expected get");
        };
        assert_eq!(args.log_every(), DEFAULT_LOG_EVERY);
        assert_eq!(cli.url, "ws://127.0.0.1:7420");

        let cli = Cli::try_parse_from(["fetch-backup", "get", "x", "-o", "out", "--log-every-mib", "0"])
            .unwrap();
        let Command::Get(args) = cli.command else {
            panic!("expected get");
        };
        assert_eq!(args.log_every(), u64::MAX);
    }
}
