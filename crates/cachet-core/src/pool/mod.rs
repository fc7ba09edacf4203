//! WorkerPool - CPU バウンドな解析ジョブの実行プール
//!
//! # 実行モデル
//! - 固定数の長寿命ワーカースレッド（`pool.size`）
//! - 空きワーカーがあれば即割り当て、なければ FIFO キューで待つ
//! - 1 ワーカーにつき同時に 1 タスクまで
//! - 割り当てごとにタイムアウト（既定 30 秒）
//!
//! # タイムアウト時
//! キャンセルフラグを立て、そのワーカーを退役させて新しいスレッドで置き換える。
//! 呼び出し元にはすぐ `Timeout` を返すが、枠は古いスレッドがジョブを抜けるまで
//! busy のまま。同時実行数は `pool.size` を超えない（キャンセルを無視して
//! 戻らない analyzer はその枠を占有し続ける）。古いワーカーの返信は
//! タスクごとの oneshot に閉じているので、後続タスクに混入しない。

mod registry;
mod worker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

pub use self::registry::{Analyzer, AnalyzerRegistry, CancellationFlag, Job, RegistryError};
use self::worker::{Assignment, WorkerHandle};
use crate::config::PoolConfig;
use crate::domain::{AnalysisTask, TaskKind, WorkerResult};
use crate::observability::PoolStats;

#[cfg(test)]
pub(crate) use self::registry::testing;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid task: {0}")]
    Validation(String),

    #[error("task timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("worker execution failed: {0}")]
    Execution(String),

    #[error("worker pool is shut down")]
    ShutDown,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

type Reply = oneshot::Sender<Result<WorkerResult, PoolError>>;

/// A task waiting for a free worker.
struct Pending {
    job: Job,
    reply: Reply,
    enqueued_at: Instant,
}

struct PoolState {
    /// `None` while a slot could not be respawned, and after shutdown.
    workers: Vec<Option<WorkerHandle>>,
    idle: VecDeque<usize>,
    queue: VecDeque<Pending>,
    busy: usize,
    shut_down: bool,
}

struct PoolInner {
    registry: Arc<AnalyzerRegistry>,
    timeout: Duration,
    max_buffer_bytes: usize,
    generation: AtomicU64,
    state: Mutex<PoolState>,
}

/// Bounded pool of isolated analysis workers. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Spawn `config.size` worker threads.
    pub fn start(config: &PoolConfig, registry: Arc<AnalyzerRegistry>) -> Result<Self, PoolError> {
        if config.size == 0 {
            return Err(PoolError::Validation("pool size must be at least 1".into()));
        }

        let mut workers = Vec::with_capacity(config.size);
        for id in 0..config.size {
            match WorkerHandle::spawn(id, 0, Arc::clone(&registry)) {
                Ok(handle) => workers.push(Some(handle)),
                Err(e) => {
                    for handle in workers.into_iter().flatten() {
                        drop(handle.close());
                    }
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        info!(
            size = config.size,
            timeout_ms = config.task_timeout_ms,
            kinds = ?registry.registered_kinds(),
            "worker pool started"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                registry,
                timeout: Duration::from_millis(config.task_timeout_ms),
                max_buffer_bytes: config.max_buffer_bytes,
                generation: AtomicU64::new(1),
                state: Mutex::new(PoolState {
                    workers,
                    idle: (0..config.size).collect(),
                    queue: VecDeque::new(),
                    busy: 0,
                    shut_down: false,
                }),
            }),
        })
    }

    /// Run one task on a worker and wait for its result.
    ///
    /// Validation happens before any slot is taken. `WorkerResult::Failure`
    /// (analyzer error or panic) is a successful execution from the pool's
    /// point of view.
    pub async fn execute(&self, task: AnalysisTask) -> Result<WorkerResult, PoolError> {
        self.inner.validate(&task)?;

        let (kind, payload, buffer, buffer_format, source_label) = task.into_parts();
        let job = Job {
            kind,
            payload,
            buffer,
            buffer_format,
            source_label,
            cancel: CancellationFlag::new(),
        };
        let (reply, rx) = oneshot::channel();
        self.inner.submit(Pending {
            job,
            reply,
            enqueued_at: Instant::now(),
        })?;

        rx.await.unwrap_or(Err(PoolError::ShutDown))
    }

    /// Stop accepting work. Queued tasks fail with `ShutDown`; in-flight tasks
    /// still deliver their results. Idempotent.
    pub async fn shutdown(&self) {
        let (pending, idle_threads, detached) = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;

            let pending: Vec<Pending> = state.queue.drain(..).collect();
            let idle: Vec<usize> = state.idle.drain(..).collect();
            let mut idle_threads: Vec<JoinHandle<()>> = Vec::with_capacity(idle.len());
            for slot in idle {
                if let Some(handle) = state.workers[slot].take() {
                    idle_threads.push(handle.close());
                }
            }
            // 実行中のワーカーは受信箱だけ閉じて切り離す（ジョブ完了後に自然終了）
            let mut detached = 0usize;
            for handle in state.workers.iter_mut().filter_map(Option::take) {
                drop(handle.close());
                detached += 1;
            }
            (pending, idle_threads, detached)
        };

        for p in pending {
            let _ = p.reply.send(Err(PoolError::ShutDown));
        }

        let joined = idle_threads.len();
        let join = tokio::task::spawn_blocking(move || {
            for thread in idle_threads {
                let _ = thread.join();
            }
        })
        .await;
        if let Err(e) = join {
            warn!(error = %e, "failed to join idle workers");
        }

        info!(joined, detached, "worker pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total: PoolInner::live_workers(&state),
            available: state.idle.len(),
            busy: state.busy,
            queued: state.queue.len(),
        }
    }

    pub fn registry(&self) -> &Arc<AnalyzerRegistry> {
        &self.inner.registry
    }
}

impl PoolInner {
    fn validate(&self, task: &AnalysisTask) -> Result<(), PoolError> {
        if !self.registry.contains(task.kind()) {
            return Err(PoolError::Validation(format!(
                "no analyzer registered for task kind '{}'",
                task.kind()
            )));
        }
        if !task.payload().is_object() {
            return Err(PoolError::Validation("payload must be a JSON object".into()));
        }
        if task.source_label().trim().is_empty() {
            return Err(PoolError::Validation("source label must not be empty".into()));
        }
        if task.buffer().len() > self.max_buffer_bytes {
            return Err(PoolError::Validation(format!(
                "buffer of {} bytes exceeds the {} byte limit",
                task.buffer().len(),
                self.max_buffer_bytes
            )));
        }
        Ok(())
    }

    fn submit(self: &Arc<Self>, pending: Pending) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(PoolError::ShutDown);
        }
        match state.idle.pop_front() {
            Some(slot) => self.dispatch(&mut state, slot, pending),
            None if Self::live_workers(&state) == 0 => {
                return Err(PoolError::Execution("no live workers".into()));
            }
            None => {
                debug!(kind = %pending.job.kind, queued = state.queue.len() + 1, "all workers busy, task queued");
                state.queue.push_back(pending);
            }
        }
        Ok(())
    }

    /// Hand `pending` to the worker in `slot` and arm its timeout.
    ///
    /// Called with the state lock held; the slot must not be in `idle`.
    fn dispatch(self: &Arc<Self>, state: &mut PoolState, slot: usize, pending: Pending) {
        let Pending {
            job,
            reply,
            enqueued_at,
        } = pending;
        let kind = job.kind.clone();
        let cancel = job.cancel.clone();
        let (worker_tx, worker_rx) = oneshot::channel();

        let mut assignment = Assignment {
            job,
            reply: worker_tx,
        };
        // 送信失敗 = スレッドが既に死んでいる。1 度だけ差し替えて再送する
        for attempt in 0..2 {
            let Some(handle) = state.workers[slot].as_ref() else {
                break;
            };
            match handle.send(assignment) {
                Ok(()) => {
                    state.busy += 1;
                    debug!(
                        worker_id = slot,
                        generation = handle.generation,
                        %kind,
                        waited_ms = enqueued_at.elapsed().as_millis() as u64,
                        "task dispatched"
                    );
                    self.supervise(slot, kind, cancel, worker_rx, reply);
                    return;
                }
                Err(returned) => {
                    assignment = returned;
                    if attempt == 0 {
                        self.respawn(state, slot);
                    }
                }
            }
        }

        error!(worker_id = slot, %kind, "no live worker for slot");
        let _ = reply.send(Err(PoolError::Execution(format!(
            "worker {slot} is unavailable"
        ))));
        Self::fail_queue_if_no_workers(state);
    }

    fn supervise(
        self: &Arc<Self>,
        slot: usize,
        kind: TaskKind,
        cancel: CancellationFlag,
        mut worker_rx: oneshot::Receiver<WorkerResult>,
        reply: Reply,
    ) {
        let inner = Arc::clone(self);
        let timeout = self.timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, &mut worker_rx).await {
                Ok(Ok(result)) => {
                    inner.release(slot, false);
                    let _ = reply.send(Ok(result));
                }
                Ok(Err(_)) => {
                    error!(worker_id = slot, %kind, "worker exited without replying");
                    inner.release(slot, true);
                    let _ = reply.send(Err(PoolError::Execution(format!(
                        "worker {slot} exited without replying"
                    ))));
                }
                Err(_) => {
                    cancel.cancel();
                    let timeout_ms = timeout.as_millis() as u64;
                    warn!(worker_id = slot, %kind, timeout_ms, "task timed out, retiring worker");
                    inner.retire(slot);
                    let _ = reply.send(Err(PoolError::Timeout { timeout_ms }));

                    // 退役したスレッドがジョブを抜けるまで枠は埋まったまま
                    let started = Instant::now();
                    let _ = worker_rx.await;
                    debug!(
                        worker_id = slot,
                        %kind,
                        overran_ms = started.elapsed().as_millis() as u64,
                        "retired worker finished its job"
                    );
                    inner.release(slot, false);
                }
            }
        });
    }

    /// Return `slot` to service: hand it the next queued task or mark it idle.
    ///
    /// A slot without a live thread gets one first.
    fn release(self: &Arc<Self>, slot: usize, respawn: bool) {
        let mut state = self.state.lock();
        state.busy = state.busy.saturating_sub(1);

        if state.shut_down {
            return;
        }
        if respawn || state.workers[slot].is_none() {
            self.respawn(&mut state, slot);
            if state.workers[slot].is_none() {
                Self::fail_queue_if_no_workers(&mut state);
                return;
            }
        }

        while let Some(pending) = state.queue.pop_front() {
            if pending.reply.is_closed() {
                debug!(kind = %pending.job.kind, "dropping queued task, caller stopped waiting");
                continue;
            }
            self.dispatch(&mut state, slot, pending);
            return;
        }
        state.idle.push_back(slot);
    }

    /// Swap in a fresh thread for a timed-out slot. The slot stays busy until
    /// the old thread's job returns.
    fn retire(&self, slot: usize) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        self.respawn(&mut state, slot);
    }

    /// Replace the worker in `slot` with a fresh thread.
    ///
    /// The old thread is detached: it exits after its current job.
    fn respawn(&self, state: &mut PoolState, slot: usize) {
        if let Some(old) = state.workers[slot].take() {
            debug!(worker_id = old.id, generation = old.generation, "retiring worker");
            drop(old.close());
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        match WorkerHandle::spawn(slot, generation, Arc::clone(&self.registry)) {
            Ok(handle) => {
                info!(worker_id = slot, generation, "worker respawned");
                state.workers[slot] = Some(handle);
            }
            Err(e) => {
                error!(worker_id = slot, error = %e, "failed to respawn worker, capacity reduced");
            }
        }
    }

    fn live_workers(state: &PoolState) -> usize {
        state.workers.iter().filter(|w| w.is_some()).count()
    }

    /// With every slot lost nothing would ever drain the queue.
    fn fail_queue_if_no_workers(state: &mut PoolState) {
        if Self::live_workers(state) > 0 || state.queue.is_empty() {
            return;
        }
        error!(queued = state.queue.len(), "no live workers left, failing queued tasks");
        for pending in state.queue.drain(..) {
            let _ = pending
                .reply
                .send(Err(PoolError::Execution("no live workers".into())));
        }
    }
}
