//! AnalyzerRegistry - TaskKind ごとの Analyzer を登録・管理
//!
//! Analyzer はワーカースレッド上で同期的に実行される（CPU バウンド処理）。
//! async runtime には触れないこと。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde_json::Value;

use crate::domain::{BufferFormat, TaskKind};

/// Cooperative cancellation signal raised when the caller stops waiting.
///
/// Long-running analyzers should poll `is_cancelled()` between steps; the
/// result of a cancelled job is discarded either way.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What an analyzer sees of a task.
#[derive(Debug)]
pub struct Job {
    pub kind: TaskKind,
    pub payload: Value,
    pub buffer: Bytes,
    pub buffer_format: BufferFormat,
    pub source_label: String,
    pub cancel: CancellationFlag,
}

impl Job {
    /// Buffer as UTF-8, for text based formats.
    pub fn text(&self) -> Result<&str, String> {
        std::str::from_utf8(&self.buffer).map_err(|e| format!("{}: {e}", self.source_label))
    }
}

/// Analysis logic for one task kind.
///
/// `Err` becomes `WorkerResult::Failure`. Panics are caught by the worker and
/// reported the same way.
pub trait Analyzer: Send + Sync + 'static {
    fn kind(&self) -> TaskKind;

    fn analyze(&self, job: &Job) -> Result<Value, String>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("analyzer for task kind '{0}' is already registered")]
    AlreadyRegistered(TaskKind),
}

#[derive(Default)]
pub struct AnalyzerRegistry {
    analyzers: HashMap<TaskKind, Arc<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: Analyzer>(&mut self, analyzer: A) -> Result<(), RegistryError> {
        let kind = analyzer.kind();
        if self.analyzers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.analyzers.insert(kind, Arc::new(analyzer));
        Ok(())
    }

    pub fn get(&self, kind: &TaskKind) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &TaskKind) -> bool {
        self.analyzers.contains_key(kind)
    }

    pub fn registered_kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.analyzers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for AnalyzerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerRegistry")
            .field("kinds", &self.registered_kinds())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! テスト用の Analyzer

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    /// Echoes the payload back, optionally sleeping first.
    pub struct EchoAnalyzer {
        pub kind: &'static str,
        pub delay: Duration,
    }

    impl Analyzer for EchoAnalyzer {
        fn kind(&self) -> TaskKind {
            TaskKind::new(self.kind)
        }

        fn analyze(&self, job: &Job) -> Result<Value, String> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Ok(serde_json::json!({
                "payload": job.payload,
                "bytes": job.buffer.len(),
                "label": job.source_label,
            }))
        }
    }

    /// Tracks the maximum number of concurrent `analyze` calls.
    pub struct GaugeAnalyzer {
        pub current: Arc<AtomicUsize>,
        pub peak: Arc<AtomicUsize>,
        pub delay: Duration,
    }

    impl Analyzer for GaugeAnalyzer {
        fn kind(&self) -> TaskKind {
            TaskKind::new("test.gauge.v1")
        }

        fn analyze(&self, _job: &Job) -> Result<Value, String> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    pub struct FailingAnalyzer;

    impl Analyzer for FailingAnalyzer {
        fn kind(&self) -> TaskKind {
            TaskKind::new("test.fail.v1")
        }

        fn analyze(&self, _job: &Job) -> Result<Value, String> {
            Err("rule engine rejected input".to_string())
        }
    }

    pub struct PanickingAnalyzer;

    impl Analyzer for PanickingAnalyzer {
        fn kind(&self) -> TaskKind {
            TaskKind::new("test.panic.v1")
        }

        fn analyze(&self, _job: &Job) -> Result<Value, String> {
            panic!("analyzer blew up");
        }
    }

    /// Sleeps in small steps until cancelled or `limit` elapses.
    pub struct StuckAnalyzer {
        pub limit: Duration,
        pub observed_cancel: Arc<AtomicBool>,
    }

    impl Analyzer for StuckAnalyzer {
        fn kind(&self) -> TaskKind {
            TaskKind::new("test.stuck.v1")
        }

        fn analyze(&self, job: &Job) -> Result<Value, String> {
            let start = std::time::Instant::now();
            while start.elapsed() < self.limit {
                if job.cancel.is_cancelled() {
                    self.observed_cancel.store(true, Ordering::SeqCst);
                    return Err("cancelled".to_string());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(Value::Null)
        }
    }
}
