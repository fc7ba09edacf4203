//! Domain identifiers.
//!
//! # ArtifactId の名前空間
//! artifact の id には 2 つの名前空間がある：
//! - **ContentHash**: 保存するバイト列から決定的に導出（同じ入力 → 同じ id、自動 dedup）
//! - **Random**: ULID ベース。自然な dedup キーを持たない生成物・変更済み artifact 用
//!
//! 名前空間は `IdNamespace` タグとしてレコードに明示的に保持する。
//! 文字列プレフィックス（`sha256-` / `art-`）は URL などの境界で表示・パースする時にだけ使う。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use ulid::Ulid;

/// Which id namespace an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdNamespace {
    ContentHash,
    Random,
}

impl IdNamespace {
    /// Prefix used when the id is rendered as text.
    pub fn prefix(self) -> &'static str {
        match self {
            IdNamespace::ContentHash => "sha256-",
            IdNamespace::Random => "art-",
        }
    }

    /// Tag persisted in the `namespace` column of durable backends.
    pub fn as_str(self) -> &'static str {
        match self {
            IdNamespace::ContentHash => "content_hash",
            IdNamespace::Random => "random",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "content_hash" => Some(IdNamespace::ContentHash),
            "random" => Some(IdNamespace::Random),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error("unknown artifact id prefix: {0}")]
    UnknownPrefix(String),

    #[error("malformed content hash: {0}")]
    MalformedHash(String),

    #[error("malformed random id: {0}")]
    MalformedRandom(String),

    #[error("namespace tag {tag} does not match id {id}")]
    NamespaceMismatch { tag: String, id: String },
}

/// Identifier of a stored artifact.
///
/// The namespace is carried as an explicit tag; the `key` is the
/// namespace-specific part (hex digest or ULID text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId {
    namespace: IdNamespace,
    key: String,
}

impl ArtifactId {
    /// Content-hash id of a single byte sequence.
    pub fn content_hash(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self {
            namespace: IdNamespace::ContentHash,
            key: hex::encode(digest),
        }
    }

    /// Content-hash id of several byte sequences.
    ///
    /// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` hash differently.
    pub fn content_hash_of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        Self {
            namespace: IdNamespace::ContentHash,
            key: hex::encode(hasher.finalize()),
        }
    }

    pub fn random(ulid: Ulid) -> Self {
        Self {
            namespace: IdNamespace::Random,
            key: ulid.to_string(),
        }
    }

    /// Rebuild an id from a persisted `(namespace, id)` pair.
    pub fn from_stored(namespace_tag: &str, rendered: &str) -> Result<Self, IdParseError> {
        let namespace =
            IdNamespace::from_tag(namespace_tag).ok_or_else(|| IdParseError::NamespaceMismatch {
                tag: namespace_tag.to_string(),
                id: rendered.to_string(),
            })?;
        let id: ArtifactId = rendered.parse()?;
        if id.namespace != namespace {
            return Err(IdParseError::NamespaceMismatch {
                tag: namespace_tag.to_string(),
                id: rendered.to_string(),
            });
        }
        Ok(id)
    }

    pub fn namespace(&self) -> IdNamespace {
        self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_content_hash(&self) -> bool {
        self.namespace == IdNamespace::ContentHash
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.namespace.prefix(), self.key)
    }
}

impl FromStr for ArtifactId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(key) = s.strip_prefix(IdNamespace::ContentHash.prefix()) {
            let valid = key.len() == 64
                && key
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
            if !valid {
                return Err(IdParseError::MalformedHash(s.to_string()));
            }
            return Ok(Self {
                namespace: IdNamespace::ContentHash,
                key: key.to_string(),
            });
        }

        if let Some(key) = s.strip_prefix(IdNamespace::Random.prefix()) {
            let ulid =
                Ulid::from_string(key).map_err(|_| IdParseError::MalformedRandom(s.to_string()))?;
            // ULID のデコードは大文字小文字を区別しない。正規形以外は受け付けない
            if ulid.to_string() != key {
                return Err(IdParseError::MalformedRandom(s.to_string()));
            }
            return Ok(Self::random(ulid));
        }

        Err(IdParseError::UnknownPrefix(s.to_string()))
    }
}

impl Serialize for ArtifactId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of a client session, supplied by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// URI a session can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceUri(String);

impl ResourceUri {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The resource URI under which updates of a stored artifact are announced.
    pub fn for_artifact(id: &ArtifactId) -> Self {
        Self(format!("artifact://{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
