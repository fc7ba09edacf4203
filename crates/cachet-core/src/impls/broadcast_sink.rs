//! BroadcastEventSink - tokio broadcast チャネルへの配送
//!
//! transport 層（WebSocket / SSE など）は `subscribe()` で受信側を取り、
//! `Delivery::session` を見て自分の接続に流す。受信側がいなければ捨てる（fire-and-forget）。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::{ResourceEvent, SessionId};
use crate::ports::EventSink;

/// One event addressed to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub session: SessionId,
    pub event: ResourceEvent,
}

#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<Delivery>,
}

impl BroadcastEventSink {
    /// `capacity` is per receiver; slow receivers see `Lagged` and lose the oldest events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, session: &SessionId, event: &ResourceEvent) {
        let delivery = Delivery {
            session: session.clone(),
            event: event.clone(),
        };
        if self.tx.send(delivery).is_err() {
            trace!(session = %session, "no transport listening, event dropped");
        }
    }
}
