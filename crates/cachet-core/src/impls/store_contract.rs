//! ArtifactStore の共通契約テスト
//!
//! 各バックエンドのテストから呼ぶ。ストアは `ttl_ms = 100` と `FixedClock` で作っておくこと。

use bytes::Bytes;
use chrono::Duration;

use crate::domain::{ArtifactId, ContentType, Expiry, IdNamespace, ListRequest, SessionId, StoreOptions};
use crate::ports::{ArtifactStore, Clock, FixedClock};

fn json_options(id: &ArtifactId) -> StoreOptions {
    StoreOptions::new(ContentType::Json).with_id(id.clone())
}

pub async fn round_trip(store: &dyn ArtifactStore) {
    let receipt = store
        .store(
            Bytes::from_static(b"{\"ok\":true}"),
            StoreOptions::new(ContentType::Json).owned_by(SessionId::new("session-1")),
        )
        .await
        .unwrap();
    assert_eq!(receipt.id.namespace(), IdNamespace::Random);
    assert!(!receipt.replaced);

    let stored = store.get(&receipt.id).await.unwrap().unwrap();
    assert_eq!(stored.id, receipt.id);
    assert_eq!(stored.content, Bytes::from_static(b"{\"ok\":true}"));
    assert_eq!(stored.content_type, ContentType::Json);
    assert_eq!(stored.expires_at, receipt.expires_at);
    assert_eq!(stored.owner_session_id, Some(SessionId::new("session-1")));

    let content_id = ArtifactId::content_hash(b"rules: []");
    let receipt = store
        .store(
            Bytes::from_static(b"rules: []"),
            StoreOptions::new(ContentType::Yaml).with_id(content_id.clone()),
        )
        .await
        .unwrap();
    assert_eq!(receipt.id, content_id);
    let stored = store.get(&content_id).await.unwrap().unwrap();
    assert_eq!(stored.content_type, ContentType::Yaml);
    assert_eq!(stored.owner_session_id, None);
}

/// Live strictly before `T`, missing from `T` on.
pub async fn expires_at_deadline(store: &dyn ArtifactStore, clock: &FixedClock) {
    let id = ArtifactId::content_hash(b"expiring");
    let receipt = store
        .store(Bytes::from_static(b"{}"), json_options(&id))
        .await
        .unwrap();
    let deadline = receipt.expires_at.at().unwrap();
    assert_eq!(deadline, clock.now() + Duration::milliseconds(100));

    clock.advance(Duration::milliseconds(99));
    assert!(store.get(&id).await.unwrap().is_some());

    clock.advance(Duration::milliseconds(1));
    assert!(store.get(&id).await.unwrap().is_none());
}

pub async fn cleanup_counts_expired(store: &dyn ArtifactStore, clock: &FixedClock) {
    let stale = ArtifactId::content_hash(b"stale");
    store
        .store(Bytes::from_static(b"{}"), json_options(&stale))
        .await
        .unwrap();
    clock.advance(Duration::milliseconds(60));
    let fresh = ArtifactId::content_hash(b"fresh");
    store
        .store(Bytes::from_static(b"{}"), json_options(&fresh))
        .await
        .unwrap();
    clock.advance(Duration::milliseconds(60));

    assert_eq!(store.cleanup().await.unwrap(), 1);
    assert_eq!(store.cleanup().await.unwrap(), 0);
    assert!(store.get(&stale).await.unwrap().is_none());
    assert!(store.get(&fresh).await.unwrap().is_some());
}

/// Store created with `ttl_ms <= 0`.
pub async fn never_expires(store: &dyn ArtifactStore, clock: &FixedClock) {
    let id = ArtifactId::content_hash(b"forever");
    let receipt = store
        .store(Bytes::from_static(b"{}"), json_options(&id))
        .await
        .unwrap();
    assert_eq!(receipt.expires_at, Expiry::Never);

    clock.advance(Duration::days(3650));
    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.expires_at, Expiry::Never);
    assert_eq!(store.cleanup().await.unwrap(), 0);
}

pub async fn overwrite_reports_replaced(store: &dyn ArtifactStore, clock: &FixedClock) {
    let id = ArtifactId::content_hash(b"overwrite");
    let first = store
        .store(Bytes::from_static(b"{\"v\":1}"), json_options(&id))
        .await
        .unwrap();
    assert!(!first.replaced);

    clock.advance(Duration::milliseconds(10));
    let second = store
        .store(Bytes::from_static(b"{\"v\":2}"), json_options(&id))
        .await
        .unwrap();
    assert!(second.replaced);
    // 上書きで期限も作り直される
    assert!(second.expires_at.at() > first.expires_at.at());
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().content,
        Bytes::from_static(b"{\"v\":2}")
    );

    // 期限切れの行を上書きしても replaced にはならない
    clock.advance(Duration::milliseconds(500));
    let third = store
        .store(Bytes::from_static(b"{\"v\":3}"), json_options(&id))
        .await
        .unwrap();
    assert!(!third.replaced);
}

pub async fn delete_is_idempotent(store: &dyn ArtifactStore) {
    let id = ArtifactId::content_hash(b"doomed");
    store
        .store(Bytes::from_static(b"{}"), json_options(&id))
        .await
        .unwrap();
    store.delete(&id).await.unwrap();
    store.delete(&id).await.unwrap();
    assert!(store.get(&id).await.unwrap().is_none());
    store
        .delete(&ArtifactId::content_hash(b"never stored"))
        .await
        .unwrap();
}

pub async fn lists_live_entries_in_pages(store: &dyn ArtifactStore, clock: &FixedClock) {
    let expired = ArtifactId::content_hash(b"old");
    store
        .store(Bytes::from_static(b"{}"), json_options(&expired))
        .await
        .unwrap();
    clock.advance(Duration::milliseconds(150));

    let mut expected: Vec<String> = Vec::new();
    for n in 0..5u8 {
        let body = format!("{{\"n\":{n}}}");
        let id = ArtifactId::content_hash(body.as_bytes());
        store
            .store(Bytes::from(body), json_options(&id))
            .await
            .unwrap();
        expected.push(id.to_string());
    }
    expected.sort();

    let mut seen: Vec<String> = Vec::new();
    let mut request = ListRequest::first_page(2);
    let mut pages = 0;
    loop {
        let page = store.list_all(request.clone()).await.unwrap();
        pages += 1;
        assert!(page.items.len() <= 2);
        for item in &page.items {
            assert!(item.content.is_some());
            seen.push(item.summary.id.to_string());
        }
        match page.next_cursor {
            Some(cursor) => request = ListRequest::first_page(2).after(cursor),
            None => break,
        }
    }

    assert_eq!(pages, 3);
    assert_eq!(seen, expected);
}

pub async fn metadata_only_skips_content(store: &dyn ArtifactStore) {
    let id = ArtifactId::content_hash(b"meta");
    store
        .store(Bytes::from_static(b"0123456789"), json_options(&id))
        .await
        .unwrap();

    let page = store
        .list_all(ListRequest::default().metadata_only())
        .await
        .unwrap();
    let item = page
        .items
        .iter()
        .find(|item| item.summary.id == id)
        .unwrap();
    assert_eq!(item.content, None);
    assert_eq!(item.summary.size_bytes, 10);
    assert_eq!(item.summary.content_type, ContentType::Json);
    assert_eq!(page.next_cursor, None);
}

pub async fn sequential_writes_last_wins(store: &dyn ArtifactStore) {
    let id = ArtifactId::content_hash(b"contended");
    for n in 0..5 {
        store
            .store(Bytes::from(format!("{{\"n\":{n}}}")), json_options(&id))
            .await
            .unwrap();
    }
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().content,
        Bytes::from_static(b"{\"n\":4}")
    );
}
