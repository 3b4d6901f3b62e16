//! Hierarchical cancellation: one token per run, one per (run, model).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Marker error for cooperative aborts. Callers downcast to tell a
/// cancellation apart from an upstream failure.
#[derive(Debug, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.is::<Cancelled>()
}

/// One-shot cancel signal. Cloning shares the signal; triggering is
/// idempotent and wakes every waiter, including in-flight stream reads
/// racing `cancelled()` in a `select!`.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in self, so wait_for cannot see a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory registry of cancel tokens keyed by run and by (run, model).
#[derive(Default)]
pub struct CancelRegistry {
    runs: Mutex<HashMap<String, CancelToken>>,
    models: Mutex<HashMap<(String, String), CancelToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_run(&self, run_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.runs.lock().insert(run_id.to_string(), token.clone());
        token
    }

    pub fn register_model(&self, run_id: &str, model_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.models
            .lock()
            .insert((run_id.to_string(), model_id.to_string()), token.clone());
        token
    }

    /// Triggers the run token and every model token under the run.
    /// Returns false when the run has no registered token.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let run_token = self.runs.lock().get(run_id).cloned();
        for ((rid, _), token) in self.models.lock().iter() {
            if rid == run_id {
                token.cancel();
            }
        }
        match run_token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Triggers one worker's token only.
    pub fn cancel_model(&self, run_id: &str, model_id: &str) -> bool {
        let token = self
            .models
            .lock()
            .get(&(run_id.to_string(), model_id.to_string()))
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops all entries for a run on terminal transition.
    pub fn remove_run(&self, run_id: &str) {
        self.runs.lock().remove(run_id);
        self.models.lock().retain(|(rid, _), _| rid != run_id);
    }

    pub fn run_token(&self, run_id: &str) -> Option<CancelToken> {
        self.runs.lock().get(run_id).cloned()
    }
}
