//! Handler trait for processing client messages.
//!
//! Implementors provide the backup logic while the server framework handles
//! connection management, routing, and per-call cancellation.

use std::future::Future;
use std::pin::Pin;

use dbfetch_protocol::constants::{HEALTH_SERVING, PING_ACK};
use dbfetch_protocol::envelope::Message;
use dbfetch_protocol::{HealthResponse, MessageType, PongResponse};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionMeta, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling client messages.
///
/// Unary calls (`ping`, `health`) have default replies. `get_backup` runs in
/// its own task; `cancel` fires when the client sends `cancel_backup` with
/// the same id, the connection drops, or the server shuts down.
pub trait Handler: Send + Sync + 'static {
    /// Called for `get_backup`. The handler owns the call until it returns
    /// and must finish it with `backup_end` or an `error` message.
    fn on_get_backup(
        &self,
        sender: Sender,
        msg: Message,
        cancel: CancellationToken,
    ) -> HandlerFuture<'_>;

    /// Called for `ping`.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let pong = PongResponse {
                ack: PING_ACK.into(),
            };
            if let Ok(reply) = msg.reply(MessageType::Pong, Some(&pong)) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `health`.
    fn on_health(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let health = HealthResponse {
                status: HEALTH_SERVING.into(),
            };
            if let Ok(reply) = msg.reply(MessageType::HealthResponse, Some(&health)) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called when a client disconnects (cleanup hook).
    fn on_client_disconnected(&self, meta: ConnectionMeta) -> HandlerFuture<'_> {
        let _ = meta;
        Box::pin(async {})
    }
}
