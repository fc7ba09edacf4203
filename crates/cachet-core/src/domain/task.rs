use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::ids::ArtifactId;

/// Kind of analysis a task requests (which analyzer runs it).
///
/// 命名規約: `{domain}.{check}.v{major}` (例: `spec.lint.v1`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Encoding of the task buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferFormat {
    Json,
    Yaml,
    Text,
    Binary,
}

impl BufferFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferFormat::Json => "json",
            BufferFormat::Yaml => "yaml",
            BufferFormat::Text => "text",
            BufferFormat::Binary => "binary",
        }
    }
}

/// A unit of CPU-bound work submitted to the worker pool.
///
/// Immutable once built. `buffer` is a reference-counted byte region: handing
/// the task to a worker moves the handle, the bytes are never copied.
#[derive(Debug, Clone)]
pub struct AnalysisTask {
    kind: TaskKind,
    payload: serde_json::Value,
    buffer: Bytes,
    buffer_format: BufferFormat,
    source_label: String,
}

impl AnalysisTask {
    pub fn new(
        kind: TaskKind,
        payload: serde_json::Value,
        buffer: impl Into<Bytes>,
        buffer_format: BufferFormat,
        source_label: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            payload,
            buffer: buffer.into(),
            buffer_format,
            source_label: source_label.into(),
        }
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn buffer_format(&self) -> BufferFormat {
        self.buffer_format
    }

    pub fn source_label(&self) -> &str {
        &self.source_label
    }

    /// Content-hash cache key over the task inputs.
    ///
    /// `source_label` is diagnostic only and is not part of the key.
    /// serde_json の Map は BTreeMap なので、キー順に依存せず決定的になる。
    pub fn cache_key(&self) -> ArtifactId {
        let payload = serde_json::to_vec(&self.payload).unwrap_or_default();
        ArtifactId::content_hash_of_parts(&[
            self.kind.as_str().as_bytes(),
            payload.as_slice(),
            self.buffer_format.as_str().as_bytes(),
            self.buffer.as_ref(),
        ])
    }

    pub(crate) fn into_parts(self) -> (TaskKind, serde_json::Value, Bytes, BufferFormat, String) {
        (
            self.kind,
            self.payload,
            self.buffer,
            self.buffer_format,
            self.source_label,
        )
    }
}
