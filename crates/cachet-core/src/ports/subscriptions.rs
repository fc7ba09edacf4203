//! SubscriptionBroker port - セッションの購読管理
//!
//! 購読は sliding TTL（subscribe のたびに延長）。
//! artifact の固定 TTL とは意図的に別ポリシーにしている：
//! 購読は「まだ聞いているか」、artifact は「この payload がいつまで有効か」を表す。

use async_trait::async_trait;

use crate::domain::{ResourceUri, SessionId};

#[async_trait]
pub trait SubscriptionBroker: Send + Sync {
    /// Idempotent; refreshes the TTL of an existing subscription.
    async fn subscribe(&self, session: &SessionId, uri: &ResourceUri);

    /// No-op when absent.
    async fn unsubscribe(&self, session: &SessionId, uri: &ResourceUri);

    /// Live subscribers only; lapsed entries are filtered at read time.
    async fn get_subscribers(&self, uri: &ResourceUri) -> Vec<SessionId>;

    /// Session teardown. Returns how many subscriptions were removed.
    async fn unsubscribe_all(&self, session: &SessionId) -> usize;

    /// Sweep lapsed subscriptions; returns how many were removed.
    async fn cleanup(&self) -> u64;
}
