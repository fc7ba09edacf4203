//! EventSink port - セッションへのイベント配送
//!
//! 配送は fire-and-forget。ack もリトライもモデル化しない。
//! 実際の送信（WebSocket / SSE など）は transport 層の責務。

use crate::domain::{ResourceEvent, SessionId};

pub trait EventSink: Send + Sync {
    fn emit(&self, session: &SessionId, event: &ResourceEvent);
}

/// Drops every event. Used when no transport is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _session: &SessionId, _event: &ResourceEvent) {}
}
