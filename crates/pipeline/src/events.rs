//! Observer channel for status events.

use mydata_model::StatusEvent;
use tokio::sync::mpsc;

/// Sending half of the observer channel.
///
/// Sending never blocks and never fails: events are dropped once the
/// receiver is gone.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }
}
