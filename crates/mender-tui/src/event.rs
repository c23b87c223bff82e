use std::time::Duration;

use crossterm::event::{self, Event as CrosstermEvent, KeyEvent, KeyEventKind};
use tokio::sync::broadcast;
use tracing::debug;

use mender_core::types::FlowEvent;

/// Input to one iteration of the TUI loop.
pub enum TuiEvent {
    Key(KeyEvent),
    /// Something happened on the event bus.
    Flow(FlowEvent),
    /// Redraw: spinner frame, terminal resize, or missed bus events.
    Tick,
}

/// Multiplexes the terminal, the flow event bus and a redraw timer.
pub struct EventLoop {
    flow_rx: broadcast::Receiver<FlowEvent>,
    tick_interval: Duration,
}

impl EventLoop {
    /// Ticks shorter than a millisecond are raised to one.
    pub fn new(flow_rx: broadcast::Receiver<FlowEvent>, tick_interval: Duration) -> Self {
        Self {
            flow_rx,
            tick_interval: tick_interval.max(Duration::from_millis(1)),
        }
    }

    /// Next event; `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<TuiEvent> {
        let poll_for = self.tick_interval.min(Duration::from_millis(50));
        let terminal = tokio::task::spawn_blocking(move || {
            if event::poll(poll_for).unwrap_or(false) {
                event::read().ok()
            } else {
                None
            }
        });

        tokio::select! {
            result = self.flow_rx.recv() => match result {
                Ok(evt) => Some(TuiEvent::Flow(evt)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Snapshots are re-read every frame, so skipping is safe
                    debug!(missed, "Event bus lagged");
                    Some(TuiEvent::Tick)
                }
                Err(broadcast::error::RecvError::Closed) => None,
            },
            result = terminal => Some(
                result
                    .ok()
                    .flatten()
                    .and_then(key_press)
                    .map(TuiEvent::Key)
                    .unwrap_or(TuiEvent::Tick),
            ),
            _ = tokio::time::sleep(self.tick_interval) => Some(TuiEvent::Tick),
        }
    }
}

/// Key presses only; releases and repeats are dropped.
fn key_press(event: CrosstermEvent) -> Option<KeyEvent> {
    match event {
        CrosstermEvent::Key(key) if key.kind == KeyEventKind::Press => Some(key),
        _ => None,
    }
}
