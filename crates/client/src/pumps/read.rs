//! WebSocket read pump: routes incoming messages to their callers.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use dbfetch_protocol::constants::{MessageType, WS_ERR_CODE_INTERNAL, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use dbfetch_protocol::envelope::Message;
use dbfetch_protocol::{BackupStatus, TransferFrame, parse_data_frame};

use crate::ClientError;
use crate::routes::{Routes, StreamEvent};

/// Reads messages from the WebSocket and dispatches them.
///
/// Any incoming message resets the silence deadline; if nothing arrives
/// within [`WS_PONG_WAIT`] the connection is considered dead. On exit every
/// open route is dropped and `cancel` is triggered so the other pumps stop.
pub(crate) async fn read_pump<S>(
    mut read: S,
    routes: Arc<Routes>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("no traffic for {:?}, closing connection", WS_PONG_WAIT);
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &routes).await;
                            }
                            tungstenite::Message::Binary(data) => {
                                handle_data_frame(&data, &routes).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            tungstenite::Message::Frame(_) => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    routes.close_all();
    cancel.cancel();
}

/// Handles a text message from the WebSocket.
async fn handle_text_message(text: &str, routes: &Routes) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    // Unary reply.
    if let Some(tx) = routes.take_pending(&msg.id) {
        let _ = tx.send(msg);
        return;
    }

    let Some(tx) = routes.stream(&msg.id) else {
        debug!(msg_type = ?msg.msg_type, id = %msg.id, "message for unknown call, dropping");
        return;
    };

    let event = match msg.msg_type {
        MessageType::BackupStatus => match msg.require_payload::<BackupStatus>() {
            Ok(status) => StreamEvent::Frame(TransferFrame::Status(status)),
            Err(e) => StreamEvent::Failed(e.into()),
        },
        MessageType::BackupEnd => StreamEvent::End,
        MessageType::Error => {
            let (code, message) = match msg.error {
                Some(err) => (err.code, err.message),
                None => (WS_ERR_CODE_INTERNAL, "unspecified server error".to_string()),
            };
            StreamEvent::Failed(ClientError::Server { code, message })
        }
        other => {
            warn!(msg_type = ?other, id = %msg.id, "unexpected message on backup stream");
            return;
        }
    };

    forward(routes, &msg.id, tx, event).await;
}

/// Handles a binary data frame.
async fn handle_data_frame(data: &[u8], routes: &Routes) {
    let (header, payload) = match parse_data_frame(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("failed to parse data frame: {e}");
            return;
        }
    };

    let Some(tx) = routes.stream(&header.id) else {
        debug!(id = %header.id, "data frame for unknown call, dropping");
        return;
    };
    forward(
        routes,
        &header.id,
        tx,
        StreamEvent::Frame(TransferFrame::Data(payload)),
    )
    .await;
}

/// Delivers `event` to a stream, forgetting the route once it is terminal
/// or the receiver is gone.
async fn forward(routes: &Routes, id: &str, tx: mpsc::Sender<StreamEvent>, event: StreamEvent) {
    let terminal = !matches!(event, StreamEvent::Frame(_));
    if terminal {
        routes.remove_stream(id);
    }
    if tx.send(event).await.is_err() {
        debug!(id, "backup stream dropped by caller");
        routes.remove_stream(id);
    }
}
