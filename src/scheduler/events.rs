//! Scheduler lifecycle events: a buffered broadcast bus plus an ordered
//! replay buffer so tests and diagnostics can inspect the full history
//! after the fact.

use crate::run::{Flow, RunId, RunStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// One scheduler lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SchedulerEvent {
    Enqueued {
        run_id: RunId,
        card_path: PathBuf,
        flow: Flow,
        position: usize,
    },
    BackpressureSoft {
        depth: usize,
        limit: usize,
    },
    Deferred {
        card_path: PathBuf,
        depth: usize,
        limit: usize,
    },
    Started {
        run_id: RunId,
        card_path: PathBuf,
        flow: Flow,
        attempt: u32,
    },
    RetryScheduled {
        run_id: RunId,
        card_path: PathBuf,
        /// The attempt the retry will make, 1-indexed.
        attempt: u32,
        delay_ms: u64,
    },
    Finished {
        run_id: RunId,
        card_path: PathBuf,
        status: RunStatus,
    },
}

/// Fan-out bus. Buffered so a slow subscriber lags (and is told so by the
/// broadcast channel) instead of blocking the scheduler.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
    history: Arc<Mutex<Vec<SchedulerEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn emit(&self, event: SchedulerEvent) {
        self.history
            .lock()
            .expect("event history lock poisoned")
            .push(event.clone());
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Every event emitted so far, in order.
    pub fn history(&self) -> Vec<SchedulerEvent> {
        self.history
            .lock()
            .expect("event history lock poisoned")
            .clone()
    }
}
