//! AppContext - プロセス全体で共有するハンドル
//!
//! pool / store / broker / signer / sink を 1 つずつ持つ。グローバルは使わない。
//! `AppBuilder::build()` で初期化し、`shutdown()` で逆順に止める。
//!
//! # analyze のフロー
//! 1. タスク入力から content-hash のキャッシュキーを導出
//! 2. キャッシュにあれば dispatch せずにそのまま返す
//! 3. なければ pool で実行 → JSON にして保存 → 署名 URL を発行
//! 4. 既存の live artifact を上書きした場合だけ購読者へ "updated" を fan-out

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::gc_loop::{self, GcLoop, SweepReport};
use super::publisher;
use super::retrieval::{self, Retrieved, RetrievalError};
use crate::config::SigningConfig;
use crate::domain::{
    AnalysisTask, ArtifactId, ContentType, Expiry, ResourceEvent, ResourceUri, SessionId,
    StoreOptions, WorkerResult,
};
use crate::error::CachetError;
use crate::observability::PoolStats;
use crate::pool::WorkerPool;
use crate::ports::{ArtifactStore, Clock, EventSink, SubscriptionBroker};
use crate::signing::{SignedAccessToken, Signer};

/// What a caller gets back after `analyze` or `publish`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishReceipt {
    pub id: ArtifactId,
    pub expires_at: Expiry,
    pub token: SignedAccessToken,
    pub url: String,
    /// A live artifact with the same id was overwritten.
    pub replaced: bool,
    /// Served from the store without running an analyzer.
    pub cache_hit: bool,
    /// Sessions that received an "updated" event.
    pub notified: usize,
}

pub struct AppContext {
    pool: WorkerPool,
    store: Arc<dyn ArtifactStore>,
    broker: Arc<dyn SubscriptionBroker>,
    sink: Arc<dyn EventSink>,
    signer: Signer,
    signing: SigningConfig,
    clock: Arc<dyn Clock>,
    gc: Mutex<Option<GcLoop>>,
    closed: AtomicBool,
}

impl AppContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pool: WorkerPool,
        store: Arc<dyn ArtifactStore>,
        broker: Arc<dyn SubscriptionBroker>,
        sink: Arc<dyn EventSink>,
        signer: Signer,
        signing: SigningConfig,
        clock: Arc<dyn Clock>,
        gc: Option<GcLoop>,
    ) -> Self {
        Self {
            pool,
            store,
            broker,
            sink,
            signer,
            signing,
            clock,
            gc: Mutex::new(gc),
            closed: AtomicBool::new(false),
        }
    }

    /// Run `task` (or reuse a cached result) and publish the JSON output.
    pub async fn analyze(&self, task: AnalysisTask) -> Result<PublishReceipt, CachetError> {
        let key = task.cache_key();
        if let Some(cached) = self.store.get(&key).await? {
            debug!(artifact_id = %key, kind = %task.kind(), "analysis cache hit");
            let token = self.mint(&key);
            return Ok(PublishReceipt {
                id: key,
                expires_at: cached.expires_at,
                url: token.url(&self.signing.base_url),
                token,
                replaced: false,
                cache_hit: true,
                notified: 0,
            });
        }

        let kind = task.kind().clone();
        let data = match self.pool.execute(task).await? {
            WorkerResult::Success { data } => data,
            WorkerResult::Failure { error } => return Err(CachetError::Analysis(error)),
        };
        let content = Bytes::from(serde_json::to_vec(&data)?);
        debug!(artifact_id = %key, kind = %kind, size = content.len(), "analysis finished");

        self.publish(content, StoreOptions::new(ContentType::Json).with_id(key))
            .await
    }

    /// Store `content`, mint a signed URL, and notify subscribers when an existing artifact was replaced.
    pub async fn publish(
        &self,
        content: Bytes,
        options: StoreOptions,
    ) -> Result<PublishReceipt, CachetError> {
        let receipt = self.store.store(content, options).await?;

        let notified = if receipt.replaced {
            let event = ResourceEvent::updated(receipt.id.clone(), receipt.expires_at);
            publisher::fan_out(self.broker.as_ref(), self.sink.as_ref(), &event).await
        } else {
            0
        };

        let token = self.mint(&receipt.id);
        Ok(PublishReceipt {
            url: token.url(&self.signing.base_url),
            token,
            id: receipt.id,
            expires_at: receipt.expires_at,
            replaced: receipt.replaced,
            cache_hit: false,
            notified,
        })
    }

    /// Signed retrieval endpoint: raw query values in, bytes and content type out.
    pub async fn fetch_signed(
        &self,
        id: &str,
        expires: &str,
        sig: &str,
    ) -> Result<Retrieved, RetrievalError> {
        retrieval::retrieve(
            &self.signer,
            self.store.as_ref(),
            self.clock.now(),
            id,
            expires,
            sig,
        )
        .await
    }

    pub async fn subscribe(&self, session: &SessionId, uri: &ResourceUri) {
        self.broker.subscribe(session, uri).await;
    }

    pub async fn unsubscribe(&self, session: &SessionId, uri: &ResourceUri) {
        self.broker.unsubscribe(session, uri).await;
    }

    /// Drop every subscription of a disconnected session.
    pub async fn end_session(&self, session: &SessionId) -> usize {
        self.broker.unsubscribe_all(session).await
    }

    pub async fn sweep(&self) -> Result<SweepReport, CachetError> {
        Ok(gc_loop::sweep(self.store.as_ref(), self.broker.as_ref()).await?)
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn SubscriptionBroker> {
        &self.broker
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Stop the GC loop, drain the pool and release the store. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let gc = self.gc.lock().take();
        if let Some(gc) = gc {
            gc.shutdown_and_join().await;
        }
        self.pool.shutdown().await;
        self.store.close().await;
        info!("app context shut down");
    }

    fn mint(&self, id: &ArtifactId) -> SignedAccessToken {
        self.signer.mint(
            id,
            self.clock.now(),
            Duration::from_secs(self.signing.url_ttl_secs),
        )
    }
}
