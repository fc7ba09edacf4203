//! AppBuilder - AppContext の構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - 設定の検証（`CachetConfig::validate`）
//! - `expect_kinds()` で宣言した task kind がすべて登録済みか
//! - ストアのオープン（接続失敗はここで返す）

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::context::AppContext;
use super::gc_loop::GcLoop;
use crate::config::CachetConfig;
use crate::error::CachetError;
use crate::impls::{self, InMemorySubscriptions};
use crate::pool::{Analyzer, AnalyzerRegistry, RegistryError, WorkerPool};
use crate::ports::{
    ArtifactStore, Clock, EventSink, IdGenerator, NoopEventSink, SystemClock, UlidGenerator,
};
use crate::signing::Signer;

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task kinds: {0:?}. These kinds were expected but no analyzer is registered.")]
    MissingKinds(Vec<String>),
}

/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(config)
///     .register(SpecLinter)?
///     .expect_kinds(&["spec.lint.v1"])
///     .build()
///     .await?;
/// ```
pub struct AppBuilder {
    config: CachetConfig,
    registry: AnalyzerRegistry,
    expected_kinds: Option<Vec<String>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    sink: Option<Arc<dyn EventSink>>,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl AppBuilder {
    pub fn new(config: CachetConfig) -> Self {
        Self {
            config,
            registry: AnalyzerRegistry::new(),
            expected_kinds: None,
            clock: None,
            ids: None,
            sink: None,
            store: None,
        }
    }

    pub fn register<A: Analyzer>(mut self, analyzer: A) -> Result<Self, RegistryError> {
        self.registry.register(analyzer)?;
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Where "updated" events go. Events are dropped when unset.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use `store` instead of opening the configured backend.
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Result<AppContext, CachetError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_kinds {
            let registered = self.registry.registered_kinds();
            let missing: Vec<String> = expected
                .iter()
                .filter(|kind| !registered.iter().any(|r| r.as_str() == kind.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingKinds(missing).into());
            }
        }

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(clock.clone())),
        };
        let sink: Arc<dyn EventSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(NoopEventSink),
        };

        let signer = match self.config.signing.secret_hex.as_deref() {
            Some(secret_hex) => Signer::from_hex(secret_hex)?,
            None => {
                warn!("signing.secret_hex not set, using a random secret; signed urls will not survive a restart");
                Signer::generate()?
            }
        };

        let store = match self.store {
            Some(store) => store,
            None => impls::open_store(&self.config.store, clock.clone(), ids).await?,
        };
        let broker = Arc::new(InMemorySubscriptions::new(
            self.config.subscriptions.ttl_ms,
            clock.clone(),
        ));

        let pool = match WorkerPool::start(&self.config.pool, Arc::new(self.registry)) {
            Ok(pool) => pool,
            Err(e) => {
                store.close().await;
                return Err(e.into());
            }
        };

        let gc = (self.config.gc.interval_ms > 0).then(|| {
            GcLoop::spawn(
                Duration::from_millis(self.config.gc.interval_ms),
                store.clone(),
                broker.clone(),
            )
        });

        Ok(AppContext::new(
            pool,
            store,
            broker,
            sink,
            signer,
            self.config.signing,
            clock,
            gc,
        ))
    }
}
