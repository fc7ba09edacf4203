//! SqliteStore - 組み込み SQLite ファイルの ArtifactStore
//!
//! # スキーマ
//! 単一テーブル `artifacts`。時刻はすべて epoch ミリ秒の INTEGER、`expires_at` が NULL なら無期限。
//! 生存条件は `expires_at IS NULL OR expires_at > :now`。
//!
//! # 書き込み
//! トランザクションの最初の文を書き込み（期限切れ行の削除）にして、
//! 読み取りロックから書き込みロックへの昇格待ちで `SQLITE_BUSY` にならないようにする。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tracing::{debug, info};

use crate::domain::{
    ArtifactId, ArtifactSummary, ContentType, Expiry, ListItem, ListPage, ListRequest, SessionId,
    StoreOptions, StoreReceipt, StoredArtifact,
};
use crate::ports::{ArtifactStore, BackendKind, Clock, IdGenerator, StoreError};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS artifacts (
    id               TEXT PRIMARY KEY NOT NULL,
    namespace        TEXT NOT NULL,
    content          BLOB NOT NULL,
    content_type     TEXT NOT NULL,
    owner_session_id TEXT,
    size_bytes       INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    expires_at       INTEGER
)
"#;

const CREATE_EXPIRES_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_artifacts_expires_at ON artifacts (expires_at)";

const UPSERT: &str = r#"
INSERT INTO artifacts (id, namespace, content, content_type, owner_session_id, size_bytes, created_at, expires_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    namespace = excluded.namespace,
    content = excluded.content,
    content_type = excluded.content_type,
    owner_session_id = excluded.owner_session_id,
    size_bytes = excluded.size_bytes,
    created_at = excluded.created_at,
    expires_at = excluded.expires_at
"#;

const DELETE_EXPIRED_ID: &str =
    "DELETE FROM artifacts WHERE id = ? AND expires_at IS NOT NULL AND expires_at <= ?";

const LIST_WITH_CONTENT: &str = r#"
SELECT id, namespace, content_type, owner_session_id, size_bytes, created_at, expires_at, content
FROM artifacts
WHERE (expires_at IS NULL OR expires_at > ?) AND id > ?
ORDER BY id
LIMIT ?
"#;

const LIST_METADATA: &str = r#"
SELECT id, namespace, content_type, owner_session_id, size_bytes, created_at, expires_at
FROM artifacts
WHERE (expires_at IS NULL OR expires_at > ?) AND id > ?
ORDER BY id
LIMIT ?
"#;

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::unavailable(BackendKind::Sqlite, e)
}

pub struct SqliteStore {
    pool: SqlitePool,
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(
        path: &Path,
        max_connections: u32,
        ttl_ms: i64,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self {
            pool,
            ttl_ms,
            clock,
            ids,
        };
        store.migrate().await?;
        info!(path = %path.display(), max_connections, "sqlite artifact store opened");
        Ok(store)
    }

    /// Private in-memory database. Lives as long as its single connection.
    pub async fn in_memory(
        ttl_ms: i64,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, StoreError> {
        let options = "sqlite::memory:"
            .parse::<SqliteConnectOptions>()
            .map_err(db_err)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self {
            pool,
            ttl_ms,
            clock,
            ids,
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
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

    fn summary_from_row(row: &SqliteRow) -> Result<ArtifactSummary, StoreError> {
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
impl ArtifactStore for SqliteStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn store(
        &self,
        content: Bytes,
        options: StoreOptions,
    ) -> Result<StoreReceipt, StoreError> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let expires_at = Expiry::from_ttl(now, self.ttl_ms);
        let id = options
            .id
            .unwrap_or_else(|| self.ids.generate_artifact_id());
        let key = id.to_string();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(DELETE_EXPIRED_ID)
            .bind(&key)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let replaced = sqlx::query("SELECT 1 FROM artifacts WHERE id = ?")
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_some();

        sqlx::query(UPSERT)
            .bind(&key)
            .bind(id.namespace().as_str())
            .bind(content.as_ref())
            .bind(options.content_type.as_str())
            .bind(options.owner_session_id.as_ref().map(|s| s.as_str()))
            .bind(content.len() as i64)
            .bind(now_ms)
            .bind(expires_at.to_epoch_millis())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(artifact_id = %key, replaced, bytes = content.len(), "artifact stored");

        Ok(StoreReceipt {
            id,
            expires_at,
            replaced,
        })
    }

    async fn get(&self, id: &ArtifactId) -> Result<Option<StoredArtifact>, StoreError> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let key = id.to_string();

        let row = sqlx::query(
            "SELECT id, namespace, content_type, owner_session_id, size_bytes, created_at, expires_at, content \
             FROM artifacts WHERE id = ?",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let summary = Self::summary_from_row(&row)?;
        if summary.expires_at.is_expired(now) {
            sqlx::query(DELETE_EXPIRED_ID)
                .bind(&key)
                .bind(now_ms)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            return Ok(None);
        }

        let content: Vec<u8> = row.try_get("content").map_err(db_err)?;
        Ok(Some(StoredArtifact {
            id: summary.id,
            content: Bytes::from(content),
            content_type: summary.content_type,
            created_at: summary.created_at,
            expires_at: summary.expires_at,
            owner_session_id: summary.owner_session_id,
        }))
    }

    async fn delete(&self, id: &ArtifactId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM artifacts WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_all(&self, request: ListRequest) -> Result<ListPage, StoreError> {
        let now_ms = self.clock.now().timestamp_millis();
        let page_size = request.effective_page_size();
        let sql = if request.metadata_only {
            LIST_METADATA
        } else {
            LIST_WITH_CONTENT
        };

        let rows = sqlx::query(sql)
            .bind(now_ms)
            .bind(request.cursor.as_deref().unwrap_or(""))
            .bind((page_size + 1) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let has_more = rows.len() > page_size;
        let mut items = Vec::with_capacity(page_size.min(rows.len()));
        for row in rows.iter().take(page_size) {
            let summary = Self::summary_from_row(row)?;
            let content = if request.metadata_only {
                None
            } else {
                let bytes: Vec<u8> = row.try_get("content").map_err(db_err)?;
                Some(Bytes::from(bytes))
            };
            items.push(ListItem { summary, content });
        }

        let next_cursor = if has_more {
            items.last().map(|item| item.summary.id.to_string())
        } else {
            None
        };
        Ok(ListPage { items, next_cursor })
    }

    async fn cleanup(&self) -> Result<u64, StoreError> {
        let now_ms = self.clock.now().timestamp_millis();
        let result =
            sqlx::query("DELETE FROM artifacts WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now_ms)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        let removed = result.rows_affected();
        if removed > 0 {
            debug!(removed, "expired artifacts purged");
        }
        Ok(removed)
    }

    async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
