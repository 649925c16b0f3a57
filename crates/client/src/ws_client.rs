//! WebSocket client for fetching backups.
//!
//! Unary calls are correlated by UUID. Each `get_backup` call gets its own
//! frame stream. The write pump keeps the connection alive with pings.

use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dbfetch_protocol::constants::{
    MessageType, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_REQUEST_TIMEOUT,
};
use dbfetch_protocol::envelope::Message;
use dbfetch_protocol::{GetBackupRequest, HealthResponse, PongResponse};
use dbfetch_transfer::{StreamConsumer, TransferOutcome};

use crate::ClientError;
use crate::routes::{Routes, STREAM_BUFFER_SIZE};
use crate::stream::BackupStream;

/// Outbound buffer capacity.
const WRITE_BUFFER_SIZE: usize = 256;

/// WebSocket client connected to a single backup server.
pub struct BackupClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    routes: Arc<Routes>,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl BackupClient {
    /// Connects to a backup server, e.g. `ws://host:port`.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();
        info!(url, "connected to backup server");

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(WRITE_BUFFER_SIZE);
        let routes = Arc::new(Routes::default());
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
            WS_PING_PERIOD,
        ));
        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            Arc::clone(&routes),
            write_tx.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            write_tx,
            routes,
            _read_handle: read_handle,
            _write_handle: write_handle,
            cancel,
        })
    }

    /// Sends a request and waits for the response.
    pub async fn send_request<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.routes.insert_pending(&id, tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.routes.take_pending(&id);
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(WS_REQUEST_TIMEOUT, rx).await;

        // Clean up pending entry on any exit path.
        self.routes.take_pending(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(ClientError::Server {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Liveness check; returns the server's acknowledgement.
    pub async fn ping(&self) -> Result<PongResponse, ClientError> {
        let resp = self
            .send_request(MessageType::Ping, Option::<&()>::None)
            .await?;
        Ok(resp.require_payload()?)
    }

    /// Returns the server's health status.
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let resp = self
            .send_request(MessageType::Health, Option::<&()>::None)
            .await?;
        Ok(resp.require_payload()?)
    }

    /// Starts a `get_backup` call and returns its frame stream.
    pub async fn get_backup(&self, backup_id: &str) -> Result<BackupStream, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let req = GetBackupRequest {
            backup_id: backup_id.to_string(),
        };
        let msg = Message::new(&id, MessageType::GetBackup, Some(&req))?;
        let json = serde_json::to_string(&msg)?;

        // Register before sending so no frame can arrive unrouted.
        let (tx, rx) = mpsc::channel(STREAM_BUFFER_SIZE);
        self.routes.insert_stream(&id, tx);
        let stream = BackupStream::new(
            id,
            rx,
            self.write_tx.clone(),
            Arc::clone(&self.routes),
        );

        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::Closed)?;

        info!(backup_id, call_id = %stream.id(), "requested backup");
        Ok(stream)
    }

    /// Fetches a backup into `destination` with the given consumer.
    pub async fn fetch_backup(
        &self,
        backup_id: &str,
        destination: &Path,
        consumer: &StreamConsumer,
    ) -> Result<TransferOutcome, ClientError> {
        let stream = self.get_backup(backup_id).await?;
        let outcome = consumer.receive(stream, destination).await?;
        Ok(outcome)
    }

    /// Returns `true` while the connection is up.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Gracefully closes the connection after everything already queued.
    pub async fn close(&self) {
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
        self.cancel.cancel();
    }
}

impl Drop for BackupClient {
    fn drop(&mut self) {
        // The write pump flushes what is queued and closes on its own.
        self.cancel.cancel();
        self._read_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use dbfetch_protocol::{BackupStatus, TransferFrame};
    use dbfetch_server::{BackupServer, Handler, HandlerFuture, Sender, ServerConfig};
    use dbfetch_transfer::TransferError;

    use super::*;

    /// Streams `hello world`, fails for `broken`, waits for cancellation for
    /// `hang`.
    #[derive(Default)]
    struct TestHandler {
        cancelled: Arc<AtomicBool>,
    }

    impl Handler for TestHandler {
        fn on_get_backup(
            &self,
            sender: Sender,
            msg: Message,
            cancel: CancellationToken,
        ) -> HandlerFuture<'_> {
            Box::pin(async move {
                let Ok(Some(req)) = msg.parse_payload::<GetBackupRequest>() else {
                    let _ = sender.deliver(msg.reply_error(400, "bad payload")).await;
                    return;
                };
                match req.backup_id.as_str() {
                    "hang" => {
                        cancel.cancelled().await;
                        self.cancelled.store(true, Ordering::SeqCst);
                        let _ = sender.deliver(msg.reply_error(499, "cancelled")).await;
                    }
                    "broken" => {
                        let _ = sender
                            .send_frame(&msg.id, TransferFrame::failed("Backup failed: boom"))
                            .await;
                        let _ = sender.deliver(msg.reply_error(502, "boom")).await;
                    }
                    _ => {
                        let data = b"hello world".to_vec();
                        let digest = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
                        let frames = [
                            TransferFrame::status("starting", 0),
                            TransferFrame::Data(data[..6].to_vec()),
                            TransferFrame::Data(data[6..].to_vec()),
                            TransferFrame::Status(
                                BackupStatus::new("done", 100)
                                    .with_bytes(11)
                                    .with_sha256(digest),
                            ),
                        ];
                        for frame in frames {
                            if sender.send_frame(&msg.id, frame).await.is_err() {
                                return;
                            }
                        }
                        let _ = sender.send_end(&msg.id).await;
                    }
                }
            })
        }
    }

    async fn start() -> (Arc<BackupServer<TestHandler>>, Arc<AtomicBool>, String) {
        let handler = TestHandler::default();
        let cancelled = Arc::clone(&handler.cancelled);
        let server = BackupServer::new(ServerConfig::default(), handler);
        let s = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = s.run().await;
        });

        let mut port = 0;
        for _ in 0..200 {
            port = server.port().await;
            if port > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(port > 0, "server did not bind");
        (server, cancelled, format!("ws://127.0.0.1:{port}"))
    }

    #[tokio::test]
    async fn ping_and_health() {
        let (server, _, url) = start().await;
        let client = BackupClient::connect(&url).await.unwrap();

        assert_eq!(client.ping().await.unwrap().ack, "pong");
        assert_eq!(client.health().await.unwrap().status, "serving");
        assert!(client.is_connected());

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn get_backup_yields_frames_in_order() {
        let (server, _, url) = start().await;
        let client = BackupClient::connect(&url).await.unwrap();

        let frames: Vec<_> = client
            .get_backup("nightly")
            .await
            .unwrap()
            .collect()
            .await;
        let frames: Vec<TransferFrame> = frames.into_iter().map(Result::unwrap).collect();

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1], TransferFrame::Data(b"hello ".to_vec()));
        assert_eq!(frames[2], TransferFrame::Data(b"world".to_vec()));
        assert!(frames[3].as_status().unwrap().is_complete());

        server.shutdown();
    }

    #[tokio::test]
    async fn fetch_backup_writes_file() {
        let (server, _, url) = start().await;
        let client = BackupClient::connect(&url).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nightly.dump");

        let outcome = client
            .fetch_backup("nightly", &dest, &StreamConsumer::new())
            .await
            .unwrap();

        assert_eq!(outcome.total_bytes, 11);
        assert!(outcome.completed);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");

        server.shutdown();
    }

    #[tokio::test]
    async fn server_failure_surfaces_as_stream_error() {
        let (server, _, url) = start().await;
        let client = BackupClient::connect(&url).await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let err = client
            .fetch_backup("broken", &dir.path().join("out"), &StreamConsumer::new())
            .await
            .unwrap_err();

        match err {
            ClientError::Transfer(TransferError::Stream(inner)) => {
                let inner = inner.downcast::<ClientError>().unwrap();
                assert!(matches!(*inner, ClientError::Server { code: 502, .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }

        server.shutdown();
    }

    #[tokio::test]
    async fn dropping_stream_cancels_server_call() {
        let (server, cancelled, url) = start().await;
        let client = BackupClient::connect(&url).await.unwrap();

        let stream = client.get_backup("hang").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(stream);

        for _ in 0..200 {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cancelled.load(Ordering::SeqCst));
        // The client is still usable.
        assert_eq!(client.ping().await.unwrap().ack, "pong");

        server.shutdown();
    }

    #[tokio::test]
    async fn explicit_cancel_ends_with_cancelled_error() {
        let (server, _, url) = start().await;
        let client = BackupClient::connect(&url).await.unwrap();

        let mut stream = client.get_backup("hang").await.unwrap();
        stream.cancel().await.unwrap();

        match stream.next().await {
            Some(Err(ClientError::Server { code, .. })) => assert_eq!(code, 499),
            other => panic!("unexpected {other:?}"),
        }
        assert!(stream.next().await.is_none());

        server.shutdown();
    }

    #[tokio::test]
    async fn server_shutdown_closes_streams() {
        let (server, _, url) = start().await;
        let client = BackupClient::connect(&url).await.unwrap();

        let mut stream = client.get_backup("hang").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(matches!(result, Some(Err(_))));
    }

    #[tokio::test]
    async fn connect_refused() {
        let result = BackupClient::connect("ws://127.0.0.1:1").await;
        assert!(matches!(result, Err(ClientError::Ws(_))));
    }
}
