//! Events - セッションへ push するリソースイベント

use serde::{Deserialize, Serialize};

use super::artifact::Expiry;
use super::ids::{ArtifactId, ResourceUri};

/// Notification pushed to a subscribed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceEvent {
    /// A `store()` overwrote the artifact behind `uri`.
    Updated {
        uri: ResourceUri,
        artifact_id: ArtifactId,
        expires_at: Expiry,
    },
}

impl ResourceEvent {
    pub fn updated(artifact_id: ArtifactId, expires_at: Expiry) -> Self {
        ResourceEvent::Updated {
            uri: ResourceUri::for_artifact(&artifact_id),
            artifact_id,
            expires_at,
        }
    }

    pub fn uri(&self) -> &ResourceUri {
        match self {
            ResourceEvent::Updated { uri, .. } => uri,
        }
    }
}
