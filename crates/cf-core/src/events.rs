//! Progress events for run observers.
//!
//! [`ProgressBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events. Sending never blocks: a slow observer lags
//! and loses events, the run loop does not wait for it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::ids::{ItemId, RunId};
use crate::item::ItemState;
use crate::stage::Stage;

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 64;

/// One item transition, as seen by an observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: RunId,
    pub stage: Stage,
    pub item_id: ItemId,
    pub new_state: ItemState,
    /// 1-based position of the item within its stage.
    pub index: usize,
    /// Number of items in the stage.
    pub total: usize,
    /// Time spent on this item so far (zero when it just started).
    pub elapsed_for_item: Duration,
    /// Mean time per finished item in this run session.
    pub running_average: Duration,
}

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
    recent: RwLock<VecDeque<ProgressEvent>>,
}

impl ProgressBus {
    /// Create a new bus; `capacity` bounds the broadcast channel buffer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to the current observer, if any.
    pub fn emit(&self, event: ProgressEvent) {
        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // Ignore send errors (no subscribers).
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<ProgressEvent> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}
