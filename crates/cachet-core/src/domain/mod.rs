//! Domain model (ids, artifacts, tasks, worker results, events).

pub mod artifact;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod task;

pub use artifact::{
    ArtifactSummary, ContentType, Expiry, ListItem, ListPage, ListRequest, StoreOptions,
    StoreReceipt, StoredArtifact,
};
pub use events::ResourceEvent;
pub use ids::{ArtifactId, IdNamespace, IdParseError, ResourceUri, SessionId};
pub use outcome::WorkerResult;
pub use task::{AnalysisTask, BufferFormat, TaskKind};
