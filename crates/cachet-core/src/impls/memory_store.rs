//! MemoryStore - プロセス内の ArtifactStore
//!
//! # 実装詳細
//! - `BTreeMap<String, MemoryEntry>`（キーは表示用 id）を RwLock で保護。id 順の keyset ページングがそのまま書ける
//! - `spill_threshold_bytes` を超える本体は `spill_dir` に書き出し、get 時に読み戻す
//! - spill ファイル名は書き込みごとに一意（`{id}-{ulid}.blob`）
//! - spill ファイルは `Arc<SpillFile>` で共有し、最後の参照が落ちたときに消す。
//!   上書きと並行して読んでいる get / list_all は古い版を最後まで読める
//! - ロックを保持したまま await しない

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::domain::{
    ArtifactId, ArtifactSummary, ContentType, Expiry, ListItem, ListPage, ListRequest, SessionId,
    StoreOptions, StoreReceipt, StoredArtifact,
};
use crate::ports::{ArtifactStore, BackendKind, Clock, IdGenerator, StoreError};

/// A spilled body on disk, removed when the last reference is dropped.
#[derive(Debug)]
struct SpillFile {
    path: PathBuf,
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove spill file"),
        }
    }
}

#[derive(Debug, Clone)]
enum Body {
    Inline(Bytes),
    Spilled(Arc<SpillFile>),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    id: ArtifactId,
    body: Body,
    size_bytes: u64,
    content_type: ContentType,
    created_at: DateTime<Utc>,
    expires_at: Expiry,
    owner_session_id: Option<SessionId>,
}

impl MemoryEntry {
    fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            id: self.id.clone(),
            content_type: self.content_type,
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            expires_at: self.expires_at,
            owner_session_id: self.owner_session_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct SpillPolicy {
    threshold_bytes: usize,
    dir: PathBuf,
}

pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, MemoryEntry>>,
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    spill: Option<SpillPolicy>,
}

impl MemoryStore {
    pub fn new(ttl_ms: i64, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            ttl_ms,
            clock,
            ids,
            spill: None,
        }
    }

    /// Write bodies larger than `threshold_bytes` to files under `dir`.
    pub fn with_spill(mut self, threshold_bytes: usize, dir: impl Into<PathBuf>) -> Self {
        self.spill = Some(SpillPolicy {
            threshold_bytes,
            dir: dir.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    async fn write_body(&self, key: &str, content: Bytes) -> Result<Body, StoreError> {
        let Some(spill) = self.spill.as_ref() else {
            return Ok(Body::Inline(content));
        };
        if content.len() <= spill.threshold_bytes {
            return Ok(Body::Inline(content));
        }

        tokio::fs::create_dir_all(&spill.dir)
            .await
            .map_err(|source| StoreError::Spill {
                path: spill.dir.clone(),
                source,
            })?;
        let path = spill.dir.join(format!("{key}-{}.blob", Ulid::new()));
        tokio::fs::write(&path, &content)
            .await
            .map_err(|source| StoreError::Spill {
                path: path.clone(),
                source,
            })?;
        debug!(artifact_id = key, path = %path.display(), bytes = content.len(), "artifact spilled to disk");
        Ok(Body::Spilled(Arc::new(SpillFile { path })))
    }

    /// `None` when a spill file was removed from outside the store.
    async fn read_body(body: &Body) -> Result<Option<Bytes>, StoreError> {
        match body {
            Body::Inline(bytes) => Ok(Some(bytes.clone())),
            Body::Spilled(file) => match tokio::fs::read(&file.path).await {
                Ok(bytes) => Ok(Some(Bytes::from(bytes))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %file.path.display(), "spill file missing");
                    Ok(None)
                }
                Err(source) => Err(StoreError::Spill {
                    path: file.path.clone(),
                    source,
                }),
            },
        }
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn store(
        &self,
        content: Bytes,
        options: StoreOptions,
    ) -> Result<StoreReceipt, StoreError> {
        let now = self.clock.now();
        let expires_at = Expiry::from_ttl(now, self.ttl_ms);
        let id = options
            .id
            .unwrap_or_else(|| self.ids.generate_artifact_id());
        let key = id.to_string();

        let size_bytes = content.len() as u64;
        let body = self.write_body(&key, content).await?;
        let entry = MemoryEntry {
            id: id.clone(),
            body,
            size_bytes,
            content_type: options.content_type,
            created_at: now,
            expires_at,
            owner_session_id: options.owner_session_id,
        };

        let previous = self.entries.write().insert(key, entry);
        let replaced = previous
            .as_ref()
            .is_some_and(|prev| prev.expires_at.is_live(now));
        drop(previous);

        Ok(StoreReceipt {
            id,
            expires_at,
            replaced,
        })
    }

    async fn get(&self, id: &ArtifactId) -> Result<Option<StoredArtifact>, StoreError> {
        let now = self.clock.now();
        let key = id.to_string();

        let entry = match self.entries.read().get(&key) {
            None => return Ok(None),
            Some(entry) => entry.clone(),
        };

        if entry.expires_at.is_expired(now) {
            // 遅延削除。読んでから消すまでに上書きされていたら消さない
            let removed = {
                let mut entries = self.entries.write();
                let still_expired = entries
                    .get(&key)
                    .is_some_and(|current| current.expires_at.is_expired(now));
                if still_expired {
                    entries.remove(&key)
                } else {
                    None
                }
            };
            drop(removed);
            return Ok(None);
        }

        let Some(content) = Self::read_body(&entry.body).await? else {
            return Ok(None);
        };
        Ok(Some(StoredArtifact {
            id: entry.id,
            content,
            content_type: entry.content_type,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            owner_session_id: entry.owner_session_id,
        }))
    }

    async fn delete(&self, id: &ArtifactId) -> Result<(), StoreError> {
        let removed = self.entries.write().remove(&id.to_string());
        drop(removed);
        Ok(())
    }

    async fn list_all(&self, request: ListRequest) -> Result<ListPage, StoreError> {
        let now = self.clock.now();
        let page_size = request.effective_page_size();

        let mut window: Vec<MemoryEntry> = {
            let entries = self.entries.read();
            let lower = match request.cursor.as_deref() {
                Some(cursor) => Bound::Excluded(cursor),
                None => Bound::Unbounded,
            };
            entries
                .range::<str, _>((lower, Bound::Unbounded))
                .map(|(_, entry)| entry)
                .filter(|entry| entry.expires_at.is_live(now))
                .take(page_size + 1)
                .cloned()
                .collect()
        };

        let next_cursor = if window.len() > page_size {
            window.truncate(page_size);
            window.last().map(|entry| entry.id.to_string())
        } else {
            None
        };

        let mut items = Vec::with_capacity(window.len());
        for entry in window {
            let content = if request.metadata_only {
                None
            } else {
                match Self::read_body(&entry.body).await? {
                    Some(bytes) => Some(bytes),
                    None => continue,
                }
            };
            items.push(ListItem {
                summary: entry.summary(),
                content,
            });
        }

        Ok(ListPage { items, next_cursor })
    }

    async fn cleanup(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let removed: Vec<MemoryEntry> = {
            let mut entries = self.entries.write();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .iter()
                .filter_map(|key| entries.remove(key))
                .collect()
        };

        let count = removed.len() as u64;
        drop(removed);
        if count > 0 {
            debug!(removed = count, "expired artifacts purged");
        }
        Ok(count)
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) {
        let drained = std::mem::take(&mut *self.entries.write());
        drop(drained);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::domain::ContentType;
    use crate::impls::store_contract as contract;
    use crate::ports::{FixedClock, SystemClock, UlidGenerator};

    fn fixed_store(ttl_ms: i64) -> (MemoryStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = MemoryStore::new(
            ttl_ms,
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
        );
        (store, clock)
    }

    #[tokio::test]
    async fn round_trip() {
        let (store, _clock) = fixed_store(100);
        contract::round_trip(&store).await;
    }

    #[tokio::test]
    async fn expires_at_deadline() {
        let (store, clock) = fixed_store(100);
        contract::expires_at_deadline(&store, &clock).await;
        // 期限切れの get で遅延削除される
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cleanup_counts_expired() {
        let (store, clock) = fixed_store(100);
        contract::cleanup_counts_expired(&store, &clock).await;
    }

    #[tokio::test]
    async fn never_expires() {
        let (store, clock) = fixed_store(0);
        contract::never_expires(&store, &clock).await;
        let (store, clock) = fixed_store(-1);
        contract::never_expires(&store, &clock).await;
    }

    #[tokio::test]
    async fn overwrite_reports_replaced() {
        let (store, clock) = fixed_store(100);
        contract::overwrite_reports_replaced(&store, &clock).await;
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (store, _clock) = fixed_store(100);
        contract::delete_is_idempotent(&store).await;
    }

    #[tokio::test]
    async fn lists_live_entries_in_pages() {
        let (store, clock) = fixed_store(100);
        contract::lists_live_entries_in_pages(&store, &clock).await;
    }

    #[tokio::test]
    async fn metadata_only_skips_content() {
        let (store, _clock) = fixed_store(100);
        contract::metadata_only_skips_content(&store).await;
    }

    #[tokio::test]
    async fn sequential_writes_last_wins() {
        let (store, _clock) = fixed_store(100);
        contract::sequential_writes_last_wins(&store).await;
    }

    #[tokio::test]
    async fn wall_clock_expiry_then_cleanup() {
        let store = MemoryStore::new(
            100,
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        );
        let receipt = store
            .store(Bytes::from_static(b"{}"), StoreOptions::new(ContentType::Json))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        assert_eq!(store.cleanup().await.unwrap(), 1);
        assert!(store.get(&receipt.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_leave_exactly_one_version() {
        let (store, _clock) = fixed_store(10_000);
        let store = Arc::new(store);
        let id = ArtifactId::content_hash(b"hot key");

        let mut handles = Vec::new();
        for n in 0..16 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .store(
                        Bytes::from(format!("{{\"n\":{n}}}")),
                        StoreOptions::new(ContentType::Json).with_id(id),
                    )
                    .await
            }));
        }
        let replaced = {
            let mut count = 0;
            for handle in handles {
                if handle.await.unwrap().unwrap().replaced {
                    count += 1;
                }
            }
            count
        };

        // 最初の 1 回以外はすべて上書き
        assert_eq!(replaced, 15);
        assert_eq!(store.len(), 1);
        let content = store.get(&id).await.unwrap().unwrap().content;
        let n: serde_json::Value = serde_json::from_slice(&content).unwrap();
        assert!((0..16).contains(&n["n"].as_i64().unwrap()));
    }

    #[tokio::test]
    async fn large_bodies_spill_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _clock) = fixed_store(10_000);
        let store = store.with_spill(8, dir.path());
        let id = ArtifactId::content_hash(b"big");

        let big = Bytes::from(vec![b'x'; 100]);
        store
            .store(big.clone(), StoreOptions::new(ContentType::Yaml).with_id(id.clone()))
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(store.get(&id).await.unwrap().unwrap().content, big);

        // 小さい本体で上書きすると古い spill ファイルは消える
        store
            .store(
                Bytes::from_static(b"tiny"),
                StoreOptions::new(ContentType::Yaml).with_id(id.clone()),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().content,
            Bytes::from_static(b"tiny")
        );

        store
            .store(big.clone(), StoreOptions::new(ContentType::Yaml).with_id(id.clone()))
            .await
            .unwrap();
        store.delete(&id).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_spill_file_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _clock) = fixed_store(10_000);
        let store = store.with_spill(0, dir.path());
        let id = ArtifactId::content_hash(b"gone");
        store
            .store(Bytes::from_static(b"{}"), StoreOptions::new(ContentType::Json).with_id(id.clone()))
            .await
            .unwrap();

        for file in std::fs::read_dir(dir.path()).unwrap() {
            std::fs::remove_file(file.unwrap().path()).unwrap();
        }
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reads_during_spilled_overwrites_never_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _clock) = fixed_store(60_000);
        let store = Arc::new(store.with_spill(0, dir.path()));
        let id = ArtifactId::content_hash(b"hot spilled key");
        store
            .store(
                Bytes::from_static(b"{\"n\":0}"),
                StoreOptions::new(ContentType::Json).with_id(id.clone()),
            )
            .await
            .unwrap();

        let writer = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                for n in 1..=500 {
                    store
                        .store(
                            Bytes::from(format!("{{\"n\":{n}}}")),
                            StoreOptions::new(ContentType::Json).with_id(id.clone()),
                        )
                        .await
                        .unwrap();
                }
            })
        };
        let reader = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                let mut misses = 0usize;
                let mut reads = 0usize;
                while reads < 500 {
                    if store.get(&id).await.unwrap().is_none() {
                        misses += 1;
                    }
                    let page = store.list_all(ListRequest::default()).await.unwrap();
                    if page.items.len() != 1 {
                        misses += 1;
                    }
                    reads += 1;
                }
                misses
            })
        };

        writer.await.unwrap();
        assert_eq!(reader.await.unwrap(), 0);

        // 古い版のファイルは読み手が離れた時点で消えている
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
