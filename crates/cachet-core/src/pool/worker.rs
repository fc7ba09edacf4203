//! Worker thread
//!
//! 1 ワーカー = 1 OS スレッド + 専用の受信箱（`std::sync::mpsc`）。
//! 1 回の割り当てに対して返信はちょうど 1 つ（タスクごとの oneshot）。
//! 受信箱の送信側が drop されると、実行中のジョブを終えてからスレッドが終了する。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::registry::{AnalyzerRegistry, Job};
use crate::domain::WorkerResult;

/// One task handed to a worker.
pub(crate) struct Assignment {
    pub job: Job,
    pub reply: oneshot::Sender<WorkerResult>,
}

pub(crate) struct WorkerHandle {
    pub id: usize,
    pub generation: u64,
    inbox: mpsc::Sender<Assignment>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(
        id: usize,
        generation: u64,
        registry: Arc<AnalyzerRegistry>,
    ) -> std::io::Result<Self> {
        let (inbox, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("cachet-worker-{id}"))
            .spawn(move || worker_main(id, generation, registry, rx))?;
        Ok(Self {
            id,
            generation,
            inbox,
            thread,
        })
    }

    /// Hand over an assignment. The assignment comes back if the thread is gone.
    pub fn send(&self, assignment: Assignment) -> Result<(), Assignment> {
        self.inbox.send(assignment).map_err(|mpsc::SendError(a)| a)
    }

    /// Close the inbox. The thread exits once its current job (if any) is done.
    pub fn close(self) -> JoinHandle<()> {
        drop(self.inbox);
        self.thread
    }
}

fn worker_main(
    id: usize,
    generation: u64,
    registry: Arc<AnalyzerRegistry>,
    inbox: mpsc::Receiver<Assignment>,
) {
    debug!(worker_id = id, generation, "worker started");
    while let Ok(Assignment { job, reply }) = inbox.recv() {
        let result = run_job(&registry, &job);
        if reply.send(result).is_err() {
            debug!(worker_id = id, generation, kind = %job.kind, "result discarded, caller stopped waiting");
        }
    }
    debug!(worker_id = id, generation, "worker stopped");
}

fn run_job(registry: &AnalyzerRegistry, job: &Job) -> WorkerResult {
    let Some(analyzer) = registry.get(&job.kind) else {
        return WorkerResult::failure(format!("no analyzer registered for '{}'", job.kind));
    };

    match panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(job))) {
        Ok(Ok(data)) => WorkerResult::success(data),
        Ok(Err(error)) => WorkerResult::failure(error),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(kind = %job.kind, source = %job.source_label, %message, "analyzer panicked");
            WorkerResult::failure(format!("analyzer panicked: {message}"))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::domain::{BufferFormat, TaskKind};
    use crate::pool::registry::testing::{EchoAnalyzer, PanickingAnalyzer};
    use crate::pool::registry::CancellationFlag;

    fn registry() -> Arc<AnalyzerRegistry> {
        let mut registry = AnalyzerRegistry::new();
        registry
            .register(EchoAnalyzer {
                kind: "test.echo.v1",
                delay: Duration::ZERO,
            })
            .unwrap();
        registry.register(PanickingAnalyzer).unwrap();
        Arc::new(registry)
    }

    fn job(kind: &str, buffer: Bytes) -> Job {
        Job {
            kind: TaskKind::new(kind),
            payload: json!({"n": 1}),
            buffer,
            buffer_format: BufferFormat::Text,
            source_label: "unit".into(),
            cancel: CancellationFlag::new(),
        }
    }

    /// Reports the address of the buffer it was handed.
    struct AddressAnalyzer;

    impl crate::pool::Analyzer for AddressAnalyzer {
        fn kind(&self) -> TaskKind {
            TaskKind::new("test.address.v1")
        }

        fn analyze(&self, job: &Job) -> Result<serde_json::Value, String> {
            Ok(json!(job.buffer.as_ptr() as usize))
        }
    }

    #[test]
    fn buffer_reaches_worker_without_copy() {
        let mut registry = AnalyzerRegistry::new();
        registry.register(AddressAnalyzer).unwrap();
        let worker = WorkerHandle::spawn(0, 0, Arc::new(registry)).unwrap();

        let buffer = Bytes::from(vec![7u8; 4096]);
        let original = buffer.as_ptr() as usize;

        let (tx, rx) = oneshot::channel();
        assert!(
            worker
                .send(Assignment {
                    job: job("test.address.v1", buffer),
                    reply: tx,
                })
                .is_ok()
        );
        assert_eq!(rx.blocking_recv().unwrap(), WorkerResult::success(json!(original)));

        worker.close().join().unwrap();
    }

    #[test]
    fn echo_sees_payload_and_buffer() {
        let worker = WorkerHandle::spawn(0, 0, registry()).unwrap();

        let (tx, rx) = oneshot::channel();
        assert!(
            worker
                .send(Assignment {
                    job: job("test.echo.v1", Bytes::from_static(b"abc")),
                    reply: tx,
                })
                .is_ok()
        );
        assert_eq!(
            rx.blocking_recv().unwrap(),
            WorkerResult::success(json!({"payload": {"n": 1}, "bytes": 3, "label": "unit"}))
        );

        worker.close().join().unwrap();
    }

    #[test]
    fn panic_is_reported_and_thread_keeps_serving() {
        let worker = WorkerHandle::spawn(0, 0, registry()).unwrap();

        let (tx, rx) = oneshot::channel();
        assert!(
            worker
                .send(Assignment {
                    job: job("test.panic.v1", Bytes::new()),
                    reply: tx,
                })
                .is_ok()
        );
        match rx.blocking_recv().unwrap() {
            WorkerResult::Failure { error } => assert!(error.contains("analyzer blew up")),
            other => panic!("expected failure, got {other:?}"),
        }

        let (tx, rx) = oneshot::channel();
        assert!(
            worker
                .send(Assignment {
                    job: job("test.echo.v1", Bytes::new()),
                    reply: tx,
                })
                .is_ok()
        );
        assert!(rx.blocking_recv().unwrap().is_success());

        worker.close().join().unwrap();
    }
}
