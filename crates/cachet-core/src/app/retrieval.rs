//! Retrieval - 署名付き URL からの取得
//!
//! 未登録・期限切れ・署名不正はすべて `NotFound` に潰す。
//! どれに当たったかは debug ログにだけ残す。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::domain::ContentType;
use crate::ports::{ArtifactStore, StoreError};
use crate::signing::{SignedAccessToken, Signer};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Body of a successful signed retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieved {
    pub content: Bytes,
    pub content_type: ContentType,
}

impl Retrieved {
    /// `Content-Type` header value.
    pub fn mime(&self) -> &'static str {
        self.content_type.mime()
    }
}

pub(crate) async fn retrieve(
    signer: &Signer,
    store: &dyn ArtifactStore,
    now: DateTime<Utc>,
    id: &str,
    expires: &str,
    sig: &str,
) -> Result<Retrieved, RetrievalError> {
    let token = SignedAccessToken::parse(id, expires, sig).map_err(|e| {
        debug!(id, error = %e, "rejected signed request");
        RetrievalError::NotFound
    })?;
    signer.verify(&token, now).map_err(|e| {
        debug!(artifact_id = %token.id, error = %e, "rejected signed request");
        RetrievalError::NotFound
    })?;

    match store.get(&token.id).await? {
        Some(artifact) => Ok(Retrieved {
            content: artifact.content,
            content_type: artifact.content_type,
        }),
        None => {
            debug!(artifact_id = %token.id, "signed request for missing artifact");
            Err(RetrievalError::NotFound)
        }
    }
}
