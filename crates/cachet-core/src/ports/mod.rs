//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（SQLite, Postgres, オブジェクトストレージ, transport 層）への
//! インターフェースを提供し、実装の詳細を隠蔽します。実装は `impls` にあります。

pub mod artifact_store;
pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod subscriptions;

pub use self::artifact_store::{ArtifactStore, BackendKind, StoreError};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::subscriptions::SubscriptionBroker;
