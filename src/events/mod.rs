use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PanelEvent {
    Qr(Option<String>),
    Connected(bool),
    Incoming { from: String, message: String },
    Outgoing { to: String, message: String },
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<PanelEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Never blocks; an event with no subscribers is dropped.
    pub fn emit(&self, event: PanelEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("panel event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
