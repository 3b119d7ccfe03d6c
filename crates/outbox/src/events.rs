use shared::protocol::OutboxEvent;
use tokio::sync::broadcast;
use tracing::debug;

use crate::EventBus;

pub struct BroadcastEventBus {
    events: broadcast::Sender<OutboxEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
        self.events.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: OutboxEvent) {
        let name = event.name();
        if self.events.send(event).is_err() {
            debug!(event = name, "no subscribers for outbox event");
        }
    }
}
