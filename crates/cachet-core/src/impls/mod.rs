//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **MemoryStore**: プロセス内ストア（大きな本体はディスクへ spill）
//! - **SqliteStore**: 組み込み SQLite ファイル
//! - **RemoteStore**: Postgres メタデータ + オブジェクトストレージ
//! - **InMemorySubscriptions**: sliding TTL の購読管理
//! - **BroadcastEventSink**: tokio broadcast へのイベント配送
//!
//! バックエンドは起動時に `open_store` で一度だけ選ぶ。

pub mod broadcast_sink;
pub mod inmem_subscriptions;
pub mod memory_store;
pub mod remote_store;
pub mod sqlite_store;

#[cfg(test)]
pub(crate) mod store_contract;

use std::sync::Arc;

use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;

pub use self::broadcast_sink::{BroadcastEventSink, Delivery};
pub use self::inmem_subscriptions::InMemorySubscriptions;
pub use self::memory_store::MemoryStore;
pub use self::remote_store::RemoteStore;
pub use self::sqlite_store::SqliteStore;

use crate::config::{ObjectStoreConfig, ObjectStoreKind, StoreBackend, StoreConfig};
use crate::ports::{ArtifactStore, BackendKind, Clock, IdGenerator, StoreError};

/// Open the backend selected by `config.backend`.
pub async fn open_store(
    config: &StoreConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
) -> Result<Arc<dyn ArtifactStore>, StoreError> {
    let store: Arc<dyn ArtifactStore> = match config.backend {
        StoreBackend::Memory => {
            let mut store = MemoryStore::new(config.ttl_ms, clock, ids);
            if let Some(threshold) = config.memory.spill_threshold_bytes {
                let dir = config
                    .memory
                    .spill_dir
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join("cachet-spill"));
                store = store.with_spill(threshold, dir);
            }
            Arc::new(store)
        }
        StoreBackend::Sqlite => Arc::new(
            SqliteStore::open(
                &config.sqlite.path,
                config.sqlite.max_connections,
                config.ttl_ms,
                clock,
                ids,
            )
            .await?,
        ),
        StoreBackend::Remote => {
            let objects = build_object_store(&config.remote.object_store)?;
            Arc::new(RemoteStore::connect(&config.remote, objects, config.ttl_ms, clock, ids).await?)
        }
    };
    tracing::info!(backend = %store.backend(), ttl_ms = config.ttl_ms, "artifact store ready");
    Ok(store)
}

/// Blob side of the remote backend.
pub fn build_object_store(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>, StoreError> {
    match config.kind {
        ObjectStoreKind::Memory => Ok(Arc::new(InMemory::new())),
        ObjectStoreKind::Local => {
            let root = config
                .root
                .as_ref()
                .ok_or_else(|| misconfigured("object_store.root is required for kind = local"))?;
            std::fs::create_dir_all(root).map_err(|source| StoreError::Spill {
                path: root.clone(),
                source,
            })?;
            let fs = LocalFileSystem::new_with_prefix(root)
                .map_err(|e| StoreError::unavailable(BackendKind::Remote, e))?;
            Ok(Arc::new(fs))
        }
        ObjectStoreKind::S3 => {
            let bucket = config
                .bucket
                .as_deref()
                .ok_or_else(|| misconfigured("object_store.bucket is required for kind = s3"))?;
            // 認証情報は環境変数（AWS_ACCESS_KEY_ID など）から読む
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(region) = config.region.as_deref() {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            let s3 = builder
                .build()
                .map_err(|e| StoreError::unavailable(BackendKind::Remote, e))?;
            Ok(Arc::new(s3))
        }
    }
}

fn misconfigured(message: &str) -> StoreError {
    StoreError::BackendUnavailable {
        backend: BackendKind::Remote,
        message: message.to_string(),
        source: None,
    }
}

#[cfg(test)]
mod tests {
    use object_store::PutPayload;
    use object_store::path::Path as ObjectPath;

    use super::*;
    use crate::config::{MemoryStoreConfig, SqliteStoreConfig};
    use crate::ports::{SystemClock, UlidGenerator};

    fn deps() -> (Arc<dyn Clock>, Arc<dyn IdGenerator>) {
        (Arc::new(SystemClock), Arc::new(UlidGenerator::new(SystemClock)))
    }

    #[tokio::test]
    async fn memory_backend_is_the_default() {
        let (clock, ids) = deps();
        let store = open_store(&StoreConfig::default(), clock, ids).await.unwrap();
        assert_eq!(store.backend(), BackendKind::Memory);
        assert!(store.is_healthy().await);
    }

    #[tokio::test]
    async fn memory_backend_honours_spill_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            memory: MemoryStoreConfig {
                spill_threshold_bytes: Some(1),
                spill_dir: Some(dir.path().to_path_buf()),
            },
            ..StoreConfig::default()
        };
        let (clock, ids) = deps();
        let store = open_store(&config, clock, ids).await.unwrap();
        store
            .store(
                bytes::Bytes::from_static(b"{\"spilled\":true}"),
                crate::domain::StoreOptions::new(crate::domain::ContentType::Json),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn sqlite_backend_opens_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            backend: StoreBackend::Sqlite,
            sqlite: SqliteStoreConfig {
                path: dir.path().join("boot.db"),
                max_connections: 2,
            },
            ..StoreConfig::default()
        };
        let (clock, ids) = deps();
        let store = open_store(&config, clock, ids).await.unwrap();
        assert_eq!(store.backend(), BackendKind::Sqlite);
        assert!(store.is_healthy().await);
        store.close().await;
    }

    #[tokio::test]
    async fn local_object_store_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let objects = build_object_store(&ObjectStoreConfig {
            kind: ObjectStoreKind::Local,
            root: Some(dir.path().join("blobs")),
            ..ObjectStoreConfig::default()
        })
        .unwrap();

        objects
            .put(
                &ObjectPath::from("artifacts/sha256-abc"),
                PutPayload::from_static(b"{}"),
            )
            .await
            .unwrap();
        assert!(dir.path().join("blobs/artifacts/sha256-abc").exists());
    }

    #[test]
    fn s3_without_bucket_is_rejected() {
        let err = build_object_store(&ObjectStoreConfig {
            kind: ObjectStoreKind::S3,
            ..ObjectStoreConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::BackendUnavailable { source: None, .. }));
    }
}
