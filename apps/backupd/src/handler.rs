//! Bridges `get_backup` calls from the server onto a [`TransferSession`].

use std::sync::Arc;

use dbfetch_protocol::constants::WS_ERR_CODE_BAD_REQUEST;
use dbfetch_protocol::envelope::Message;
use dbfetch_protocol::{GetBackupRequest, TransferFrame};
use dbfetch_server::{Handler, HandlerFuture, Sender};
use dbfetch_session::TransferSession;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Frames buffered between the session and the connection.
const FRAME_BUFFER: usize = 16;

pub struct BackupHandler {
    session: Arc<TransferSession>,
}

impl BackupHandler {
    pub fn new(session: TransferSession) -> Self {
        Self {
            session: Arc::new(session),
        }
    }
}

impl Handler for BackupHandler {
    fn on_get_backup(
        &self,
        sender: Sender,
        msg: Message,
        cancel: CancellationToken,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let request = match msg.require_payload::<GetBackupRequest>() {
                Ok(request) => request,
                Err(e) => {
                    let _ = sender
                        .deliver(msg.reply_error(WS_ERR_CODE_BAD_REQUEST, e.to_string()))
                        .await;
                    return;
                }
            };
            info!(call_id = %msg.id, backup_id = %request.backup_id, "get_backup");

            let (tx, mut rx) = mpsc::channel::<TransferFrame>(FRAME_BUFFER);

            let produce = async {
                let result = self.session.run(&request, &tx, &cancel).await;
                drop(tx);
                result
            };

            // A failed send drops the receiver, which fails the session's
            // next emit.
            let forward = async {
                while let Some(frame) = rx.recv().await {
                    if sender.send_frame(&msg.id, frame).await.is_err() {
                        debug!(call_id = %msg.id, "connection gone, dropping frames");
                        break;
                    }
                }
                drop(rx);
            };

            let (result, ()) = tokio::join!(produce, forward);

            match result {
                Ok(_) => {
                    let _ = sender.send_end(&msg.id).await;
                }
                Err(e) => {
                    let _ = sender.deliver(msg.reply_error(e.code(), e.to_string())).await;
                }
            }
        })
    }
}
