//! Publisher - 上書き時の購読者への fan-out

use tracing::debug;

use crate::domain::ResourceEvent;
use crate::ports::{EventSink, SubscriptionBroker};

/// Emit `event` to every live subscriber of its URI. Returns the number of sessions notified.
pub(crate) async fn fan_out(
    broker: &dyn SubscriptionBroker,
    sink: &dyn EventSink,
    event: &ResourceEvent,
) -> usize {
    let sessions = broker.get_subscribers(event.uri()).await;
    for session in &sessions {
        sink.emit(session, event);
    }
    if !sessions.is_empty() {
        debug!(uri = %event.uri(), notified = sessions.len(), "update fanned out");
    }
    sessions.len()
}
