//! cachet-core
//!
//! Ephemeral artifact cache and job-dispatch substrate.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, artifact, task, outcome, events）
//! - **ports**: 抽象化レイヤー（ArtifactStore, SubscriptionBroker, EventSink, Clock, IdGenerator）
//! - **impls**: 実装（memory / sqlite / remote ストア、インメモリ購読、broadcast 配送）
//! - **pool**: CPU バウンドな解析を専用スレッドで実行するワーカープール
//! - **signing**: 期限付き署名 URL（HMAC-SHA256）
//! - **app**: AppBuilder / AppContext / GcLoop
//! - **config**: 設定の読み込みと検証
//! - **error**: 最上位のエラー型
//! - **observability**: tracing の初期化とプール統計

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod pool;
pub mod ports;
pub mod signing;

pub use app::{AppBuilder, AppContext, PublishReceipt};
pub use config::CachetConfig;
pub use error::{CachetError, ErrorKind};
