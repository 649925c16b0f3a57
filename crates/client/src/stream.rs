use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dbfetch_protocol::TransferFrame;
use dbfetch_protocol::constants::MessageType;
use dbfetch_protocol::envelope::Message;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::debug;

use crate::ClientError;
use crate::routes::{Routes, StreamEvent};

/// Frames of one `get_backup` call, in the order the server sent them.
///
/// Yields `Ok` frames until the server ends the call, then `None`. A
/// server-side failure or a lost connection is yielded once as `Err`.
/// Dropping the stream before it ends asks the server to cancel the call.
pub struct BackupStream {
    id: String,
    rx: mpsc::Receiver<StreamEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    routes: Arc<Routes>,
    finished: bool,
    cancel_sent: bool,
}

impl BackupStream {
    pub(crate) fn new(
        id: String,
        rx: mpsc::Receiver<StreamEvent>,
        write_tx: mpsc::Sender<tungstenite::Message>,
        routes: Arc<Routes>,
    ) -> Self {
        Self {
            id,
            rx,
            write_tx,
            routes,
            finished: false,
            cancel_sent: false,
        }
    }

    /// Request id of the call.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the call reached a terminal event.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Asks the server to cancel the call.
    ///
    /// The stream keeps yielding until the server acknowledges with its
    /// terminal error.
    pub async fn cancel(&mut self) -> Result<(), ClientError> {
        if self.finished || self.cancel_sent {
            return Ok(());
        }
        let json = serde_json::to_string(&self.cancel_message())?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::Closed)?;
        self.cancel_sent = true;
        Ok(())
    }

    fn cancel_message(&self) -> Message {
        Message::signal(&self.id, MessageType::CancelBackup)
    }
}

impl Stream for BackupStream {
    type Item = Result<TransferFrame, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Frame(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(StreamEvent::End)) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Failed(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(Err(ClientError::Closed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for BackupStream {
    fn drop(&mut self) {
        self.routes.remove_stream(&self.id);
        if self.finished || self.cancel_sent {
            return;
        }
        debug!(id = %self.id, "backup stream dropped early, cancelling call");
        if let Ok(json) = serde_json::to_string(&self.cancel_message()) {
            let _ = self
                .write_tx
                .try_send(tungstenite::Message::Text(json.into()));
        }
    }
}
