//! Fire-and-forget event fan-out.

use landing_core::Event;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default capacity of the broadcast channel. Slow subscribers lag and
/// lose the oldest events.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Sink for progress and task events. Publishing never blocks and never fails.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event);
}

/// `tokio::sync::broadcast` backed publisher.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Event>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventPublisher for Broadcaster {
    fn publish(&self, event: Event) {
        let event_type = event.event_type().as_str();
        trace!(event_type, task_id = ?event.task_id, "publishing event");
        if self.tx.send(event).is_err() {
            // No subscribers.
            debug!(event_type, "event dropped without subscribers");
        }
    }
}
