//! Artifact - ストアに保存される成果物とその周辺の型
//!
//! TTL は書き込み時に一度だけ計算する（読み取りで延長しない）。

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ArtifactId, SessionId};

/// Content type of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Json,
    Yaml,
}

impl ContentType {
    /// Value for the `Content-Type` header of the retrieval endpoint.
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Yaml => "application/yaml",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Json => "json",
            ContentType::Yaml => "yaml",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "json" => Some(ContentType::Json),
            "yaml" => Some(ContentType::Yaml),
            _ => None,
        }
    }
}

/// When something stops being valid.
///
/// `Never` is the sentinel used when the TTL is non-positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum Expiry {
    At(DateTime<Utc>),
    Never,
}

impl Expiry {
    /// `now + ttl_ms`, or `Never` when `ttl_ms <= 0`.
    pub fn from_ttl(now: DateTime<Utc>, ttl_ms: i64) -> Self {
        if ttl_ms <= 0 {
            return Expiry::Never;
        }
        // 範囲外の TTL は実質無期限として扱う
        chrono::Duration::try_milliseconds(ttl_ms)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .map_or(Expiry::Never, Expiry::At)
    }

    /// Expired once `now` reaches the deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            Expiry::At(at) => now >= *at,
            Expiry::Never => false,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now)
    }

    /// Column representation: epoch milliseconds, `NULL` for never.
    pub fn to_epoch_millis(self) -> Option<i64> {
        match self {
            Expiry::At(at) => Some(at.timestamp_millis()),
            Expiry::Never => None,
        }
    }

    pub fn from_epoch_millis(millis: Option<i64>) -> Self {
        match millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
            Some(at) => Expiry::At(at),
            None => Expiry::Never,
        }
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            Expiry::At(at) => Some(*at),
            Expiry::Never => None,
        }
    }
}

/// A stored byte payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub id: ArtifactId,
    pub content: Bytes,
    pub content_type: ContentType,
    pub created_at: DateTime<Utc>,
    pub expires_at: Expiry,
    pub owner_session_id: Option<SessionId>,
}

impl StoredArtifact {
    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            id: self.id.clone(),
            content_type: self.content_type,
            size_bytes: self.content.len() as u64,
            created_at: self.created_at,
            expires_at: self.expires_at,
            owner_session_id: self.owner_session_id.clone(),
        }
    }
}

/// Metadata of a stored artifact, without its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub id: ArtifactId,
    pub content_type: ContentType,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Expiry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_session_id: Option<SessionId>,
}

/// Options for `ArtifactStore::store`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOptions {
    /// Explicit id (e.g. a content hash). A random id is generated when absent.
    pub id: Option<ArtifactId>,
    pub content_type: ContentType,
    pub owner_session_id: Option<SessionId>,
}

impl StoreOptions {
    pub fn new(content_type: ContentType) -> Self {
        Self {
            id: None,
            content_type,
            owner_session_id: None,
        }
    }

    pub fn with_id(mut self, id: ArtifactId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn owned_by(mut self, session: SessionId) -> Self {
        self.owner_session_id = Some(session);
        self
    }
}

/// Result of a successful `store()`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreReceipt {
    pub id: ArtifactId,
    pub expires_at: Expiry,
    /// A live artifact with the same id was overwritten.
    pub replaced: bool,
}

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Cursor-based listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    /// Opaque cursor returned as `next_cursor` by the previous page.
    pub cursor: Option<String>,
    pub page_size: usize,
    /// Skip loading content bytes.
    pub metadata_only: bool,
}

impl ListRequest {
    pub fn first_page(page_size: usize) -> Self {
        Self {
            cursor: None,
            page_size,
            metadata_only: false,
        }
    }

    pub fn metadata_only(mut self) -> Self {
        self.metadata_only = true;
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Page size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_page_size(&self) -> usize {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

impl Default for ListRequest {
    fn default() -> Self {
        Self::first_page(DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListItem {
    pub summary: ArtifactSummary,
    /// `None` when the request was metadata-only.
    pub content: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListPage {
    pub items: Vec<ListItem>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[rstest]
    #[case(0)]
    #[case(-1)]
    #[case(i64::MIN)]
    fn non_positive_ttl_never_expires(#[case] ttl_ms: i64) {
        let expiry = Expiry::from_ttl(t0(), ttl_ms);
        assert_eq!(expiry, Expiry::Never);
        assert!(expiry.is_live(t0() + chrono::Duration::days(365 * 100)));
        assert_eq!(expiry.to_epoch_millis(), None);
    }

    #[test]
    fn positive_ttl_expires_at_deadline() {
        let expiry = Expiry::from_ttl(t0(), 100);
        assert!(expiry.is_live(t0() + chrono::Duration::milliseconds(99)));
        assert!(expiry.is_expired(t0() + chrono::Duration::milliseconds(100)));
        assert!(expiry.is_expired(t0() + chrono::Duration::milliseconds(150)));
    }

    #[test]
    fn expiry_column_representation() {
        let expiry = Expiry::from_ttl(t0(), 5_000);
        let millis = expiry.to_epoch_millis();
        assert_eq!(Expiry::from_epoch_millis(millis), expiry);
        assert_eq!(Expiry::from_epoch_millis(None), Expiry::Never);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(50, 50)]
    #[case(5_000, MAX_PAGE_SIZE)]
    fn page_size_is_clamped(#[case] requested: usize, #[case] effective: usize) {
        assert_eq!(
            ListRequest::first_page(requested).effective_page_size(),
            effective
        );
    }

    #[test]
    fn content_type_tags() {
        assert_eq!(ContentType::from_tag("json"), Some(ContentType::Json));
        assert_eq!(ContentType::from_tag("yaml"), Some(ContentType::Yaml));
        assert_eq!(ContentType::from_tag("xml"), None);
        assert_eq!(ContentType::Yaml.mime(), "application/yaml");
    }
}
