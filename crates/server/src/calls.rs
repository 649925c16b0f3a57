use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// In-flight streaming calls of one connection, keyed by request id.
///
/// Each call gets a child of the connection's token, so closing the
/// connection cancels every call it started.
#[derive(Debug, Clone, Default)]
pub struct CallRegistry {
    inner: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call and returns its token.
    ///
    /// Returns `None` if a call with the same id is still running.
    pub fn register(&self, id: &str, parent: &CancellationToken) -> Option<CancellationToken> {
        let mut calls = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if calls.contains_key(id) {
            return None;
        }
        let token = parent.child_token();
        calls.insert(id.to_string(), token.clone());
        Some(token)
    }

    /// Cancels the call with `id`. Returns `false` if no such call is active.
    pub fn cancel(&self, id: &str) -> bool {
        let calls = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match calls.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forgets a finished call.
    pub fn remove(&self, id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn cancel_all(&self) {
        let calls = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for token in calls.values() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
