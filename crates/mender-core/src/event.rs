use tokio::sync::broadcast;

use crate::types::FlowEvent;

/// Fan-out of [`FlowEvent`]s to every subscriber (TUI, tests, loggers).
///
/// Publishing never blocks; a subscriber that falls behind by more than the
/// channel capacity sees `Lagged` and skips ahead.
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, event: FlowEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(?event, "No subscribers for flow event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
