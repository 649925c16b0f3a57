//! Where incoming messages go, keyed by request id.

use std::collections::HashMap;
use std::sync::Mutex;

use dbfetch_protocol::TransferFrame;
use dbfetch_protocol::envelope::Message;
use tokio::sync::{mpsc, oneshot};

use crate::ClientError;

/// Capacity of each call's frame channel.
pub(crate) const STREAM_BUFFER_SIZE: usize = 64;

/// One event of a `get_backup` call.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Frame(TransferFrame),
    End,
    Failed(ClientError),
}

/// Unary requests waiting for their reply and open backup streams.
///
/// Locks are never held across an await.
#[derive(Default)]
pub(crate) struct Routes {
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    streams: Mutex<HashMap<String, mpsc::Sender<StreamEvent>>>,
}

impl Routes {
    pub(crate) fn insert_pending(&self, id: &str, tx: oneshot::Sender<Message>) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), tx);
    }

    pub(crate) fn take_pending(&self, id: &str) -> Option<oneshot::Sender<Message>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub(crate) fn insert_stream(&self, id: &str, tx: mpsc::Sender<StreamEvent>) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), tx);
    }

    pub(crate) fn stream(&self, id: &str) -> Option<mpsc::Sender<StreamEvent>> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub(crate) fn remove_stream(&self, id: &str) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub(crate) fn open_streams(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drops every route; waiters observe the connection as closed.
    pub(crate) fn close_all(&self) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
