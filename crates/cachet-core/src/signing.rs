//! Signer - 期限付き署名 URL
//!
//! 署名は `HMAC-SHA256(secret, id || "\n" || expires)` の hex。
//! サーバ側に状態は持たない（失効リストなし）。
//! URL の期限は artifact 自体の期限とは独立している：両方を満たさないと取得できない。

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::domain::ArtifactId;

type HmacSha256 = Hmac<Sha256>;

const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("malformed signed request: {0}")]
    Malformed(String),

    #[error("signature mismatch")]
    Mismatch,

    #[error("signed url expired")]
    Expired,
}

/// Stateless access grant for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAccessToken {
    pub id: ArtifactId,
    /// Unix seconds.
    pub expires: i64,
    /// Lowercase hex.
    pub sig: String,
}

impl SignedAccessToken {
    /// Rebuild a token from the raw query values of a retrieval request.
    pub fn parse(id: &str, expires: &str, sig: &str) -> Result<Self, SignatureError> {
        let id = id
            .parse::<ArtifactId>()
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        let expires = expires
            .parse::<i64>()
            .map_err(|_| SignatureError::Malformed(format!("expires={expires}")))?;
        if sig.is_empty() {
            return Err(SignatureError::Malformed("empty signature".into()));
        }
        Ok(Self {
            id,
            expires,
            sig: sig.to_string(),
        })
    }

    /// `{base}/artifacts/{id}?expires={expires}&sig={sig}`
    pub fn url(&self, base: &str) -> String {
        format!(
            "{}/artifacts/{}?expires={}&sig={}",
            base.trim_end_matches('/'),
            self.id,
            self.expires,
            self.sig
        )
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires, 0)
    }
}

#[derive(Clone)]
pub struct Signer {
    keyed: HmacSha256,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, SignatureError> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(SignatureError::Malformed(format!(
                "secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        let keyed = HmacSha256::new_from_slice(&secret)
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        Ok(Self { keyed })
    }

    pub fn from_hex(secret_hex: &str) -> Result<Self, SignatureError> {
        let secret =
            hex::decode(secret_hex).map_err(|e| SignatureError::Malformed(e.to_string()))?;
        Self::new(secret)
    }

    /// Random 32-byte secret. URLs minted with it die with the process.
    pub fn generate() -> Result<Self, SignatureError> {
        let secret: [u8; 32] = rand::random();
        Self::new(secret.to_vec())
    }

    pub fn mint(&self, id: &ArtifactId, now: DateTime<Utc>, ttl: Duration) -> SignedAccessToken {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = now.timestamp().saturating_add(ttl_secs);
        SignedAccessToken {
            id: id.clone(),
            expires,
            sig: hex::encode(self.mac(id, expires).finalize().into_bytes()),
        }
    }

    /// Constant-time check of the signature, then of the expiry.
    pub fn verify(&self, token: &SignedAccessToken, now: DateTime<Utc>) -> Result<(), SignatureError> {
        self.verify_at(token, now.timestamp())
    }

    pub fn verify_at(&self, token: &SignedAccessToken, now_secs: i64) -> Result<(), SignatureError> {
        let provided =
            hex::decode(&token.sig).map_err(|e| SignatureError::Malformed(e.to_string()))?;
        self.mac(&token.id, token.expires)
            .verify_slice(&provided)
            .map_err(|_| SignatureError::Mismatch)?;

        if now_secs > token.expires {
            return Err(SignatureError::Expired);
        }
        Ok(())
    }

    /// MAC over `id || "\n" || expires`, shared by mint and verify.
    fn mac(&self, id: &ArtifactId, expires: i64) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(id.to_string().as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }
}
