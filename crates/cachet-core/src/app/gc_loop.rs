//! GcLoop - 期限切れ artifact と購読の定期回収
//!
//! # フロー
//! 1. `interval` ごとに `sweep()` を呼ぶ（最初の即時 tick は飛ばす）
//! 2. ストアの `cleanup()` → ブローカーの `cleanup()`
//! 3. ストアの失敗はログに残して次の tick へ（リトライしない）
//!
//! 停止は watch チャネル。`shutdown_and_join()` で終了を待てる。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::ports::{ArtifactStore, StoreError, SubscriptionBroker};

/// Result of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub artifacts_removed: u64,
    pub subscriptions_removed: u64,
}

/// One pass over the store and the broker.
///
/// The broker is swept even when the store fails; the store error is returned afterwards.
pub async fn sweep(
    store: &dyn ArtifactStore,
    broker: &dyn SubscriptionBroker,
) -> Result<SweepReport, StoreError> {
    let artifacts = store.cleanup().await;
    let subscriptions_removed = broker.cleanup().await;
    Ok(SweepReport {
        artifacts_removed: artifacts?,
        subscriptions_removed,
    })
}

pub struct GcLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl GcLoop {
    pub fn spawn(
        interval: Duration,
        store: Arc<dyn ArtifactStore>,
        broker: Arc<dyn SubscriptionBroker>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run(interval, store, broker, shutdown_rx));
        Self { shutdown_tx, join }
    }

    pub async fn shutdown_and_join(self) {
        // receiver がすでに落ちていても問題ない
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "gc loop ended abnormally");
        }
    }
}

async fn run(
    interval: Duration,
    store: Arc<dyn ArtifactStore>,
    broker: Arc<dyn SubscriptionBroker>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis() as u64, backend = %store.backend(), "gc loop started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                match sweep(store.as_ref(), broker.as_ref()).await {
                    Ok(report) if report == SweepReport::default() => {
                        debug!("gc sweep found nothing");
                    }
                    Ok(report) => {
                        info!(
                            artifacts_removed = report.artifacts_removed,
                            subscriptions_removed = report.subscriptions_removed,
                            "gc sweep"
                        );
                    }
                    Err(e) => warn!(error = %e, "gc sweep failed"),
                }
            }
        }
    }

    info!("gc loop stopped");
}
