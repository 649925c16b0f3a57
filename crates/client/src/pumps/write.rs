//! WebSocket write pump: the only task that touches the socket's sink.

use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Sends queued messages in order and a ping every `ping_period`.
///
/// On cancellation whatever is already queued is still written, so a
/// `cancel_backup` from a dropped stream reaches the server before the close
/// frame. A queued `Close` ends the pump once it is sent. Exactly one close
/// frame goes out either way.
pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
    ping_period: Duration,
) where
    S: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut keepalive = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut closed = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                while let Ok(msg) = rx.try_recv() {
                    let is_close = msg.is_close();
                    if let Err(e) = sink.send(msg).await {
                        debug!("write pump flush stopped: {e}");
                        return;
                    }
                    if is_close {
                        closed = true;
                        break;
                    }
                }
                break;
            }

            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let is_close = msg.is_close();
                if let Err(e) = sink.send(msg).await {
                    error!("write pump send error: {e}");
                    return;
                }
                if is_close {
                    closed = true;
                    break;
                }
            }

            _ = keepalive.tick() => {
                if let Err(e) = sink.send(tungstenite::Message::Ping(Vec::new().into())).await {
                    error!("write pump ping error: {e}");
                    return;
                }
            }
        }
    }

    if !closed {
        let _ = sink.send(tungstenite::Message::Close(None)).await;
    }
    let _ = sink.close().await;
}
