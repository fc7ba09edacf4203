//! ArtifactStore port - TTL 付き成果物ストア
//!
//! 3 つのバックエンドが同じ契約を満たす：
//! - **memory**: プロセス内 map（大きな blob はローカルディスクへ spill 可能）
//! - **sqlite**: 単一ファイルの組み込み DB
//! - **remote**: メタデータ DB（Postgres）+ オブジェクトストレージ
//!
//! # 契約
//! - expiry は書き込み時に一度だけ `now + ttl_ms` で決まる（`ttl_ms <= 0` なら無期限）。読み取りで延長しない
//! - 期限切れと未登録は呼び出し側から区別できない（どちらも `None`）
//! - 同じ id への書き込みは last-writer-wins（CAS なし）
//! - 接続障害は自動リトライせず `StoreError::BackendUnavailable` として返す

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ArtifactId, ListPage, ListRequest, StoreOptions, StoreReceipt, StoredArtifact};

/// Which backend implementation is serving the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    Sqlite,
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Memory => "memory",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Remote => "remote",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{backend} backend unavailable: {message}")]
    BackendUnavailable {
        backend: BackendKind,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("spill file {path} failed: {source}")]
    Spill {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    pub fn unavailable<E>(backend: BackendKind, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::BackendUnavailable {
            backend,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    pub fn corrupt(id: impl Into<String>, reason: impl fmt::Display) -> Self {
        StoreError::Corrupt {
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}

/// TTL store for analysis results and produced artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Write (or fully overwrite) an artifact.
    async fn store(&self, content: Bytes, options: StoreOptions)
    -> Result<StoreReceipt, StoreError>;

    /// Unknown and expired ids both yield `None`.
    async fn get(&self, id: &ArtifactId) -> Result<Option<StoredArtifact>, StoreError>;

    /// Idempotent.
    async fn delete(&self, id: &ArtifactId) -> Result<(), StoreError>;

    /// Keyset pagination over live entries, ordered by rendered id.
    async fn list_all(&self, request: ListRequest) -> Result<ListPage, StoreError>;

    /// Purge every expired entry; returns how many were removed.
    async fn cleanup(&self) -> Result<u64, StoreError>;

    /// Liveness of external dependencies. In-process backends are always healthy.
    async fn is_healthy(&self) -> bool;

    /// Release connections. Called once from `AppContext::shutdown`.
    async fn close(&self) {}
}
