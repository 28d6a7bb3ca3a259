//! Minimal in-process event bus.
//!
//! Structurally modelled on `riptide-events::bus`: a bounded
//! broadcast-style channel per subscriber, backpressure resolved by
//! dropping the oldest buffered event rather than blocking a publisher.
//! No transport, exporter, or metrics backend lives here (those are
//! external collaborators per spec §1) — this just gives embedders a place
//! to subscribe to engine-internal happenings (asset downloads, rewrite
//! counts, stage errors).

use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    AssetDownload {
        url: String,
        bytes: usize,
        duration: std::time::Duration,
        optimizations: Vec<String>,
    },
    AssetOptimize {
        url: String,
        saved_bytes: i64,
    },
    AssetRewrite {
        count: usize,
    },
    AssetStageError {
        stage: &'static str,
        error: String,
    },
}

/// Bounded pub/sub bus. `publish` never blocks: a full subscriber simply
/// drops its oldest buffered event (matching `broadcast`'s lagging-receiver
/// semantics, which the teacher's event bus adapter also relies on).
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // A publish with no subscribers is not an error; ignore the result.
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
