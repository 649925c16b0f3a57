//! Client connection management: read/write pumps, ping/pong, send buffering.

use std::sync::Arc;

use dbfetch_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED, WS_MAX_MESSAGE_SIZE,
    WS_PING_PERIOD, WS_PONG_WAIT,
};
use dbfetch_protocol::envelope::Message;
use dbfetch_protocol::{TransferFrame, encode_data_frame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::calls::CallRegistry;
use crate::handler::Handler;

/// Metadata about a connected client.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub conn_id: u64,
    pub remote_addr: String,
}

/// Handle for sending messages to a connected client.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text without waiting.
    ///
    /// Fails if the buffer is full or the client disconnected. Use for
    /// unary replies only.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends a protocol [`Message`], waiting for buffer space.
    ///
    /// Keeps its place after every frame already queued by the same call.
    pub async fn deliver(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|_| SendError)
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Sends one frame of the `get_backup` call `id`, waiting for buffer
    /// space.
    ///
    /// Status frames become `backup_status` messages; data frames become
    /// binary messages.
    pub async fn send_frame(&self, id: &str, frame: TransferFrame) -> Result<(), SendError> {
        let ws_msg = match frame {
            TransferFrame::Status(status) => {
                let msg = Message::new(id, MessageType::BackupStatus, Some(&status))
                    .map_err(|_| SendError)?;
                let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
                WsMessage::Text(json.into())
            }
            TransferFrame::Data(data) => {
                let encoded = encode_data_frame(id, &data).map_err(|_| SendError)?;
                WsMessage::Binary(encoded.into())
            }
        };
        self.tx.send(ws_msg).await.map_err(|_| SendError)
    }

    /// Closes the `get_backup` call `id` successfully.
    pub async fn send_end(&self, id: &str) -> Result<(), SendError> {
        self.deliver(Message::signal(id, MessageType::BackupEnd)).await
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn from_channel(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to a client.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous message delivery.
pub struct ClientConnection {
    pub meta: ConnectionMeta,
    sender: Sender,
    calls: CallRegistry,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl ClientConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Number of streaming calls in flight.
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Signals shutdown of the pumps and every in-flight call.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Waits until the read pump exited and the disconnect hook ran.
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }

    pub(crate) fn finished_token(&self) -> CancellationToken {
        self.finished.clone()
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// Returns the [`ClientConnection`] handle. The pumps run as background
/// tokio tasks and stop when the connection is closed or the cancel
/// token is triggered.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    meta: ConnectionMeta,
    handler: Arc<H>,
    server_cancel: &CancellationToken,
) -> ClientConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let finished = CancellationToken::new();
    let sender = Sender { tx };
    let calls = CallRegistry::new();

    let conn = ClientConnection {
        meta: meta.clone(),
        sender: sender.clone(),
        calls: calls.clone(),
        cancel: cancel.clone(),
        finished: finished.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    // Write pump.
    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    // Read pump.
    tokio::spawn(async move {
        let ctx = DispatchContext {
            handler: Arc::clone(&handler),
            sender,
            calls,
            cancel: cancel.clone(),
        };
        read_pump(ws_stream, &ctx).await;
        // When the read pump exits, stop the write pump and every call.
        cancel.cancel();
        handler.on_client_disconnected(meta.clone()).await;
        tracing::info!(conn_id = meta.conn_id, remote = %meta.remote_addr, "client disconnected");
        finished.cancel();
    });

    conn
}

struct DispatchContext<H> {
    handler: Arc<H>,
    sender: Sender,
    calls: CallRegistry,
    cancel: CancellationToken,
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches them.
async fn read_pump<S, H>(mut stream: S, ctx: &DispatchContext<H>)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_traffic = true;

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_traffic {
                    tracing::warn!("client silent for {:?}, closing connection", WS_PONG_WAIT);
                    break;
                }
                got_traffic = false;
            }

            frame = stream.next() => {
                got_traffic = true;
                match frame {
                    Some(Ok(ws_msg)) => {
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_text(ctx, &text).await;
                            }
                            WsMessage::Binary(data) => {
                                tracing::warn!(bytes = data.len(), "unexpected binary message from client, ignoring");
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Ping(data) => {
                                let _ = ctx.sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::info!("received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {} // Raw frames ignored.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}

/// Dispatches a text (JSON) message to the appropriate handler method.
async fn dispatch_text<H: Handler>(ctx: &DispatchContext<H>, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return;
        }
    };

    let s = ctx.sender.clone();
    match msg.msg_type {
        MessageType::Ping => ctx.handler.on_ping(s, msg).await,
        MessageType::Health => ctx.handler.on_health(s, msg).await,
        MessageType::GetBackup => start_call(ctx, msg),
        MessageType::CancelBackup => {
            if ctx.calls.cancel(&msg.id) {
                tracing::info!(id = %msg.id, "backup call cancelled by client");
            } else {
                tracing::debug!(id = %msg.id, "cancel for unknown or finished call");
            }
        }
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = s.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
        }
    }
}

/// Spawns a streaming call so the read pump keeps serving cancellations.
fn start_call<H: Handler>(ctx: &DispatchContext<H>, msg: Message) {
    let Some(token) = ctx.calls.register(&msg.id, &ctx.cancel) else {
        tracing::warn!(id = %msg.id, "duplicate call id");
        let _ = ctx
            .sender
            .send_error(&msg, WS_ERR_CODE_BAD_REQUEST, "call id already in use");
        return;
    };

    let handler = Arc::clone(&ctx.handler);
    let sender = ctx.sender.clone();
    let calls = ctx.calls.clone();
    tokio::spawn(async move {
        let id = msg.id.clone();
        handler.on_get_backup(sender, msg, token).await;
        calls.remove(&id);
    });
}
