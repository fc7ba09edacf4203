//! Errors - 最上位のエラー型と運用分類
//!
//! コンポーネントごとの enum（`PoolError`, `StoreError`, `SignatureError`, ...）を
//! `CachetError` に集約する。外部に見せるメッセージは `public_message()` だけ。

use thiserror::Error;

use crate::app::{BuildError, RetrievalError};
use crate::config::ConfigError;
use crate::pool::{PoolError, RegistryError};
use crate::ports::StoreError;
use crate::signing::SignatureError;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（呼び出し側でリトライしてよい）
/// - Permanent: 恒久的なエラー（入力を直さない限り同じ結果）
/// - Infrastructure: インフラエラー（DB / オブジェクトストレージ / ディスクの障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum CachetError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    /// The analyzer ran and reported a failure.
    #[error("analysis failed: {0}")]
    Analysis(String),

    /// The analyzer succeeded but its output could not be encoded.
    #[error("failed to encode analysis output: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CachetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CachetError::Pool(PoolError::Timeout { .. }) => ErrorKind::Transient,
            CachetError::Pool(PoolError::ShutDown) => ErrorKind::Transient,
            CachetError::Pool(PoolError::Spawn(_)) => ErrorKind::Infrastructure,
            CachetError::Pool(_) => ErrorKind::Permanent,
            CachetError::Store(_) => ErrorKind::Infrastructure,
            CachetError::Retrieval(RetrievalError::Store(_)) => ErrorKind::Infrastructure,
            CachetError::Retrieval(RetrievalError::NotFound) => ErrorKind::Permanent,
            CachetError::Signature(_)
            | CachetError::Registry(_)
            | CachetError::Config(_)
            | CachetError::Build(_)
            | CachetError::Analysis(_)
            | CachetError::Encode(_) => ErrorKind::Permanent,
        }
    }

    /// Text safe to show to an end user. Internal details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            CachetError::Pool(PoolError::Timeout { .. }) => "operation did not complete in time",
            CachetError::Retrieval(RetrievalError::NotFound) | CachetError::Signature(_) => {
                "not found"
            }
            CachetError::Pool(PoolError::Validation(_)) => "invalid request",
            _ => "internal error",
        }
    }
}
