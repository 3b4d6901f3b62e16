//! Per-run publish/subscribe fan-out for progress events.

use crate::events::RunEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Mailbox depth per subscriber. A subscriber that falls this far behind
/// is dropped rather than allowed to stall the publisher.
const MAILBOX_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<RunEvent>,
}

pub struct Subscription {
    pub id: u64,
    pub run_id: String,
    pub rx: mpsc::Receiver<RunEvent>,
}

/// Best-effort fan-out. No history: a new subscriber sees only events
/// published after it attaches.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, run_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .lock()
            .entry(run_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        Subscription {
            id,
            run_id: run_id.to_string(),
            rx,
        }
    }

    pub fn unsubscribe(&self, run_id: &str, id: u64) {
        let mut topics = self.topics.lock();
        if let Some(subs) = topics.get_mut(run_id) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(run_id);
            }
        }
    }

    /// Delivers to every subscriber of the event's run without blocking.
    /// Full or disconnected mailboxes drop their subscriber; other
    /// subscribers are unaffected.
    pub fn publish(&self, event: RunEvent) {
        let mut topics = self.topics.lock();
        let Some(subs) = topics.get_mut(event.run_id()) else {
            return;
        };
        subs.retain(|s| s.tx.try_send(event.clone()).is_ok());
        if subs.is_empty() {
            topics.remove(event.run_id());
        }
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.topics.lock().get(run_id).map_or(0, |s| s.len())
    }
}
