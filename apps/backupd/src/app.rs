//! Application orchestrator: wires the agent components together.

use std::sync::Arc;

use dbfetch_artifact::ArtifactProducer;
use dbfetch_server::{BackupServer, ServerConfig};
use dbfetch_session::{SessionConfig, TransferSession};
use dbfetch_transfer::ChunkedSender;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::handler::BackupHandler;

/// Builds the backup server described by `config` without starting it.
pub fn build_server(config: &Config) -> Arc<BackupServer<BackupHandler>> {
    let producer = ArtifactProducer::new(config.dump_strategy(), config.connection_params())
        .with_remove_partial_on_failure(config.remove_partial_on_failure);
    let sender =
        ChunkedSender::new(config.chunk_size).with_staged_progress(config.staged_progress());
    let session = TransferSession::new(
        config.artifact_store(),
        Arc::new(producer),
        sender,
        SessionConfig {
            always_regenerate: config.always_regenerate,
        },
    );

    let server_config = ServerConfig {
        host: config.host,
        port: config.port,
    };
    BackupServer::new(server_config, BackupHandler::new(session))
}

/// Runs the agent until `cancel` fires or SIGINT arrives.
pub async fn run(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let server = build_server(&config);
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    tracing::info!(
        storage = %config.storage_dir.display(),
        mode = ?config.dump.mode,
        always_regenerate = config.always_regenerate,
        "agent ready"
    );

    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        result = &mut server_task => {
            // The server only returns on its own when binding fails.
            result??;
            return Ok(());
        }
    }

    tracing::info!("stopping server...");
    server.shutdown();
    server_task.await??;
    Ok(())
}
