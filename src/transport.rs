pub mod codec;
pub mod dispatcher;
pub mod sse;
pub mod stdio;

use tokio::sync::broadcast;

use crate::model::EngineEvent;

pub use codec::{Request, Response};
pub use dispatcher::Dispatcher;
pub use sse::{router, serve_bridge};
pub use stdio::run_stdio;

/// Capacity of the broadcast ring buffer behind the progress channel.
const EVENT_BUS_CAPACITY: usize = 256;

/// Fan-out for engine events. Emission never blocks the emitter; subscribers
/// that fall behind lose the oldest droppable events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Fire-and-forget; an event with no subscribers is simply dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
