//! InMemorySubscriptions - プロセス内の SubscriptionBroker
//!
//! # 実装詳細
//! - `by_uri`: URI → (セッション → 期限)
//! - `by_session`: セッション → URI 集合（セッション終了時の一括解除用）
//! - 2 つの索引は同じ Mutex の中で常に一緒に更新する
//! - 期限切れは読み取り時に除外し、削除は `cleanup` に任せる

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::domain::{Expiry, ResourceUri, SessionId};
use crate::ports::{Clock, SubscriptionBroker};

#[derive(Default)]
struct Index {
    by_uri: HashMap<ResourceUri, HashMap<SessionId, Expiry>>,
    by_session: HashMap<SessionId, HashSet<ResourceUri>>,
}

impl Index {
    fn remove_pair(&mut self, session: &SessionId, uri: &ResourceUri) -> bool {
        let mut removed = false;
        if let Some(sessions) = self.by_uri.get_mut(uri) {
            removed = sessions.remove(session).is_some();
            if sessions.is_empty() {
                self.by_uri.remove(uri);
            }
        }
        if let Some(uris) = self.by_session.get_mut(session) {
            uris.remove(uri);
            if uris.is_empty() {
                self.by_session.remove(session);
            }
        }
        removed
    }
}

pub struct InMemorySubscriptions {
    index: Mutex<Index>,
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
}

impl InMemorySubscriptions {
    /// `ttl_ms <= 0` keeps subscriptions until they are removed explicitly.
    pub fn new(ttl_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            index: Mutex::new(Index::default()),
            ttl_ms,
            clock,
        }
    }

    /// Number of stored (possibly lapsed) subscriptions.
    pub fn len(&self) -> usize {
        self.index.lock().by_uri.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().by_uri.is_empty()
    }
}

#[async_trait]
impl SubscriptionBroker for InMemorySubscriptions {
    async fn subscribe(&self, session: &SessionId, uri: &ResourceUri) {
        let expires_at = Expiry::from_ttl(self.clock.now(), self.ttl_ms);
        let mut index = self.index.lock();
        index
            .by_uri
            .entry(uri.clone())
            .or_default()
            .insert(session.clone(), expires_at);
        index
            .by_session
            .entry(session.clone())
            .or_default()
            .insert(uri.clone());
        debug!(session = %session, uri = %uri, "subscribed");
    }

    async fn unsubscribe(&self, session: &SessionId, uri: &ResourceUri) {
        if self.index.lock().remove_pair(session, uri) {
            debug!(session = %session, uri = %uri, "unsubscribed");
        }
    }

    async fn get_subscribers(&self, uri: &ResourceUri) -> Vec<SessionId> {
        let now = self.clock.now();
        let index = self.index.lock();
        let Some(sessions) = index.by_uri.get(uri) else {
            return Vec::new();
        };
        let mut live: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, expires_at)| expires_at.is_live(now))
            .map(|(session, _)| session.clone())
            .collect();
        live.sort();
        live
    }

    async fn unsubscribe_all(&self, session: &SessionId) -> usize {
        let mut index = self.index.lock();
        let Some(uris) = index.by_session.remove(session) else {
            return 0;
        };
        let mut removed = 0;
        for uri in &uris {
            if let Some(sessions) = index.by_uri.get_mut(uri) {
                if sessions.remove(session).is_some() {
                    removed += 1;
                }
                if sessions.is_empty() {
                    index.by_uri.remove(uri);
                }
            }
        }
        debug!(session = %session, removed, "session subscriptions cleared");
        removed
    }

    async fn cleanup(&self) -> u64 {
        let now = self.clock.now();
        let mut index = self.index.lock();
        let lapsed: Vec<(SessionId, ResourceUri)> = index
            .by_uri
            .iter()
            .flat_map(|(uri, sessions)| {
                sessions
                    .iter()
                    .filter(|(_, expires_at)| expires_at.is_expired(now))
                    .map(move |(session, _)| (session.clone(), uri.clone()))
            })
            .collect();

        let mut removed = 0u64;
        for (session, uri) in &lapsed {
            if index.remove_pair(session, uri) {
                removed += 1;
            }
        }
        removed
    }
}
