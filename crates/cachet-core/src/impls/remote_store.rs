//! RemoteStore - メタデータ DB（Postgres）+ オブジェクトストレージ
//!
//! # 配置
//! - メタデータ: `artifact_metadata` テーブル（時刻は epoch ミリ秒の BIGINT、`expires_at` NULL = 無期限）
//! - 本体: `<key_prefix>/<artifact id>` のオブジェクト
//!
//! # 書き込み順
//! 行ロック（`FOR UPDATE`）→ 行の upsert → 本体の put → commit。
//! put に失敗すると行はロールバックされる。同じ id への並行書き込みは行ロックで直列化されるので、
//! 最後に commit した書き込みの行と本体が揃って残る。
//!
//! 2 つのシステムにまたがるため原子的ではない。本体が消えた行（dangling row）は
//! `get` で「存在しない」として扱い、warn ログを出す。

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use tracing::{debug, info, warn};

use crate::config::RemoteStoreConfig;
use crate::domain::{
    ArtifactId, ArtifactSummary, ContentType, Expiry, ListItem, ListPage, ListRequest, SessionId,
    StoreOptions, StoreReceipt, StoredArtifact,
};
use crate::ports::{ArtifactStore, BackendKind, Clock, IdGenerator, StoreError};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS artifact_metadata (
    id               TEXT COLLATE "C" PRIMARY KEY,
    namespace        TEXT NOT NULL,
    content_type     TEXT NOT NULL,
    owner_session_id TEXT,
    size_bytes       BIGINT NOT NULL,
    created_at       BIGINT NOT NULL,
    expires_at       BIGINT
)
"#;

const CREATE_EXPIRES_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_artifact_metadata_expires_at \
     ON artifact_metadata (expires_at)";

const UPSERT: &str = r#"
INSERT INTO artifact_metadata (id, namespace, content_type, owner_session_id, size_bytes, created_at, expires_at)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (id) DO UPDATE SET
    namespace = EXCLUDED.namespace,
    content_type = EXCLUDED.content_type,
    owner_session_id = EXCLUDED.owner_session_id,
    size_bytes = EXCLUDED.size_bytes,
    created_at = EXCLUDED.created_at,
    expires_at = EXCLUDED.expires_at
"#;

const SELECT_ONE: &str = r#"
SELECT id, namespace, content_type, owner_session_id, size_bytes, created_at, expires_at
FROM artifact_metadata
WHERE id = $1
"#;

const LIST_PAGE: &str = r#"
SELECT id, namespace, content_type, owner_session_id, size_bytes, created_at, expires_at
FROM artifact_metadata
WHERE (expires_at IS NULL OR expires_at > $1) AND id > $2
ORDER BY id
LIMIT $3
"#;

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::unavailable(BackendKind::Remote, e)
}

fn blob_err(e: object_store::Error) -> StoreError {
    StoreError::unavailable(BackendKind::Remote, e)
}

pub struct RemoteStore {
    pool: PgPool,
    objects: Arc<dyn ObjectStore>,
    key_prefix: String,
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl RemoteStore {
    /// Connect to the metadata database and create the table if missing.
    pub async fn connect(
        config: &RemoteStoreConfig,
        objects: Arc<dyn ObjectStore>,
        ttl_ms: i64,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.database_url)
            .await
            .map_err(db_err)?;

        let store = Self::new(pool, objects, &config.key_prefix, ttl_ms, clock, ids);
        store.migrate().await?;
        info!(
            key_prefix = %store.key_prefix,
            max_connections = config.max_connections,
            "remote artifact store connected"
        );
        Ok(store)
    }

    /// Wrap an existing pool. Call `migrate` before first use.
    pub fn new(
        pool: PgPool,
        objects: Arc<dyn ObjectStore>,
        key_prefix: &str,
        ttl_ms: i64,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            pool,
            objects,
            key_prefix: key_prefix.trim_matches('/').to_string(),
            ttl_ms,
            clock,
            ids,
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query(CREATE_EXPIRES_INDEX)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    fn blob_path(&self, key: &str) -> ObjectPath {
        if self.key_prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{key}", self.key_prefix))
        }
    }

    /// Fetch a blob; `None` when it is missing.
    async fn read_blob(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match self.objects.get(&self.blob_path(key)).await {
            Ok(result) => Ok(Some(result.bytes().await.map_err(blob_err)?)),
            Err(object_store::Error::NotFound { .. }) => {
                warn!(artifact_id = key, "metadata row has no blob (dangling row)");
                Ok(None)
            }
            Err(e) => Err(blob_err(e)),
        }
    }

    async fn remove_blob(&self, key: &str) -> Result<(), StoreError> {
        match self.objects.delete(&self.blob_path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(blob_err(e)),
        }
    }

    fn summary_from_row(row: &PgRow) -> Result<ArtifactSummary, StoreError> {
        let rendered: String = row.try_get("id").map_err(db_err)?;
        let namespace: String = row.try_get("namespace").map_err(db_err)?;
        let id = ArtifactId::from_stored(&namespace, &rendered)
            .map_err(|e| StoreError::corrupt(&rendered, e))?;

        let content_type: String = row.try_get("content_type").map_err(db_err)?;
        let content_type = ContentType::from_tag(&content_type).ok_or_else(|| {
            StoreError::corrupt(&rendered, format!("unknown content type '{content_type}'"))
        })?;

        let created_at: i64 = row.try_get("created_at").map_err(db_err)?;
        let created_at = DateTime::<Utc>::from_timestamp_millis(created_at)
            .ok_or_else(|| StoreError::corrupt(&rendered, "created_at out of range"))?;
        let expires_at: Option<i64> = row.try_get("expires_at").map_err(db_err)?;
        let size_bytes: i64 = row.try_get("size_bytes").map_err(db_err)?;
        let owner: Option<String> = row.try_get("owner_session_id").map_err(db_err)?;

        Ok(ArtifactSummary {
            id,
            content_type,
            size_bytes: size_bytes.max(0) as u64,
            created_at,
            expires_at: Expiry::from_epoch_millis(expires_at),
            owner_session_id: owner.map(SessionId::new),
        })
    }
}

#[async_trait]
impl ArtifactStore for RemoteStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Remote
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
        let size = content.len();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing: Option<Option<i64>> =
            sqlx::query("SELECT expires_at FROM artifact_metadata WHERE id = $1 FOR UPDATE")
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .map(|row| row.try_get::<Option<i64>, _>("expires_at"))
                .transpose()
                .map_err(db_err)?;
        let replaced =
            existing.is_some_and(|expires| Expiry::from_epoch_millis(expires).is_live(now));

        sqlx::query(UPSERT)
            .bind(&key)
            .bind(id.namespace().as_str())
            .bind(options.content_type.as_str())
            .bind(options.owner_session_id.as_ref().map(|s| s.as_str()))
            .bind(size as i64)
            .bind(now.timestamp_millis())
            .bind(expires_at.to_epoch_millis())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // put が失敗したら tx は drop 時にロールバックされる
        self.objects
            .put(&self.blob_path(&key), PutPayload::from(content))
            .await
            .map_err(blob_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(artifact_id = %key, replaced, bytes = size, "artifact stored");

        Ok(StoreReceipt {
            id,
            expires_at,
            replaced,
        })
    }

    async fn get(&self, id: &ArtifactId) -> Result<Option<StoredArtifact>, StoreError> {
        let now = self.clock.now();
        let key = id.to_string();

        let row = sqlx::query(SELECT_ONE)
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let summary = Self::summary_from_row(&row)?;

        if summary.expires_at.is_expired(now) {
            let removed = sqlx::query(
                "DELETE FROM artifact_metadata WHERE id = $1 AND expires_at IS NOT NULL AND expires_at <= $2",
            )
            .bind(&key)
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            if removed.rows_affected() > 0 {
                self.remove_blob(&key).await?;
            }
            return Ok(None);
        }

        let Some(content) = self.read_blob(&key).await? else {
            return Ok(None);
        };
        Ok(Some(StoredArtifact {
            id: summary.id,
            content,
            content_type: summary.content_type,
            created_at: summary.created_at,
            expires_at: summary.expires_at,
            owner_session_id: summary.owner_session_id,
        }))
    }

    async fn delete(&self, id: &ArtifactId) -> Result<(), StoreError> {
        let key = id.to_string();
        sqlx::query("DELETE FROM artifact_metadata WHERE id = $1")
            .bind(&key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        self.remove_blob(&key).await
    }

    async fn list_all(&self, request: ListRequest) -> Result<ListPage, StoreError> {
        let now_ms = self.clock.now().timestamp_millis();
        let page_size = request.effective_page_size();

        let rows = sqlx::query(LIST_PAGE)
            .bind(now_ms)
            .bind(request.cursor.as_deref().unwrap_or(""))
            .bind((page_size + 1) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let has_more = rows.len() > page_size;
        let mut summaries = Vec::with_capacity(page_size.min(rows.len()));
        for row in rows.iter().take(page_size) {
            summaries.push(Self::summary_from_row(row)?);
        }
        let next_cursor = if has_more {
            summaries.last().map(|summary| summary.id.to_string())
        } else {
            None
        };

        let mut items = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let content = if request.metadata_only {
                None
            } else {
                match self.read_blob(&summary.id.to_string()).await? {
                    Some(bytes) => Some(bytes),
                    None => continue,
                }
            };
            items.push(ListItem { summary, content });
        }

        Ok(ListPage { items, next_cursor })
    }

    async fn cleanup(&self) -> Result<u64, StoreError> {
        let now_ms = self.clock.now().timestamp_millis();
        let rows = sqlx::query(
            "DELETE FROM artifact_metadata WHERE expires_at IS NOT NULL AND expires_at <= $1 RETURNING id",
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        for row in &rows {
            let key: String = row.try_get("id").map_err(db_err)?;
            // 行はもう消えているので、本体の削除失敗は次回以降に持ち越さずログだけ残す
            if let Err(e) = self.remove_blob(&key).await {
                warn!(artifact_id = %key, error = %e, "failed to delete expired blob");
            }
        }

        let removed = rows.len() as u64;
        if removed > 0 {
            debug!(removed, "expired artifacts purged");
        }
        Ok(removed)
    }

    async fn is_healthy(&self) -> bool {
        let db_ok = sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok();
        let prefix = ObjectPath::from(self.key_prefix.as_str());
        let blobs_ok = self
            .objects
            .list_with_delimiter(Some(&prefix))
            .await
            .is_ok();
        if !(db_ok && blobs_ok) {
            warn!(db_ok, blobs_ok, "remote artifact store unhealthy");
        }
        db_ok && blobs_ok
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
