use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use cachet_core::domain::{
    AnalysisTask, BufferFormat, ContentType, ResourceUri, SessionId, StoreOptions, TaskKind,
};
use cachet_core::impls::BroadcastEventSink;
use cachet_core::observability::init_tracing;
use cachet_core::pool::{Analyzer, Job};
use cachet_core::{AppBuilder, CachetConfig, CachetError};

const LINT_KIND: &str = "spec.lint.v1";

const SAMPLE_SPEC: &str = "openapi: 3.1.0\ninfo:\n  title: Pets \n  version: 1.0.0\npaths:\n\t/pets: {}\n";

#[derive(Debug, Deserialize)]
struct LintPayload {
    #[serde(default = "default_max_line_len")]
    max_line_len: usize,
}

fn default_max_line_len() -> usize {
    120
}

#[derive(Debug, Serialize)]
struct Finding {
    line: usize,
    rule: &'static str,
}

/// 行単位の簡単な lint（末尾空白・タブ・長すぎる行）
struct LineLinter;

impl Analyzer for LineLinter {
    fn kind(&self) -> TaskKind {
        TaskKind::new(LINT_KIND)
    }

    fn analyze(&self, job: &Job) -> Result<Value, String> {
        let p: LintPayload =
            serde_json::from_value(job.payload.clone()).map_err(|e| format!("payload: {e}"))?;
        let text = job.text()?;

        let mut findings = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if job.cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            if line.ends_with(' ') {
                findings.push(Finding { line: i + 1, rule: "trailing-whitespace" });
            }
            if line.contains('\t') {
                findings.push(Finding { line: i + 1, rule: "no-tabs" });
            }
            if line.len() > p.max_line_len {
                findings.push(Finding { line: i + 1, rule: "max-line-length" });
            }
        }
        serde_json::to_value(findings).map_err(|e| e.to_string())
    }
}

#[tokio::main]
async fn main() -> Result<(), CachetError> {
    // (A) 設定とログ（引数があれば TOML ファイルとして読む）
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = CachetConfig::load(path.as_deref())?;
    init_tracing(&config.logging);

    // (B) AppContext を構築（analyzer の登録漏れはここで落ちる）
    let sink = Arc::new(BroadcastEventSink::default());
    let mut deliveries = sink.subscribe();
    let app = AppBuilder::new(config)
        .register(LineLinter)?
        .expect_kinds(&[LINT_KIND])
        .with_event_sink(sink)
        .build()
        .await?;

    // (C) 解析を 2 回投入（2 回目はキャッシュから返る）
    let task = AnalysisTask::new(
        TaskKind::new(LINT_KIND),
        serde_json::json!({ "max_line_len": 80 }),
        Bytes::from_static(SAMPLE_SPEC.as_bytes()),
        BufferFormat::Yaml,
        "pets.yaml",
    );
    let first = app.analyze(task.clone()).await?;
    info!(artifact_id = %first.id, cache_hit = first.cache_hit, url = %first.url, "analyzed");
    let second = app.analyze(task).await?;
    info!(artifact_id = %second.id, cache_hit = second.cache_hit, "analyzed again");

    // (D) 購読してから同じ id を上書き → "updated" が届く
    let session = SessionId::new("cli-session");
    app.subscribe(&session, &ResourceUri::for_artifact(&first.id))
        .await;
    let rewritten = app
        .publish(
            Bytes::from_static(b"[]"),
            StoreOptions::new(ContentType::Json).with_id(first.id.clone()),
        )
        .await?;
    info!(replaced = rewritten.replaced, notified = rewritten.notified, "artifact overwritten");
    match deliveries.try_recv() {
        Ok(delivery) => info!(session = %delivery.session, uri = %delivery.event.uri(), "event delivered"),
        Err(e) => warn!(error = %e, "no event delivered"),
    }

    // (E) 署名付き URL で取得
    let token = &rewritten.token;
    let fetched = app
        .fetch_signed(&token.id.to_string(), &token.expires.to_string(), &token.sig)
        .await?;
    println!(
        "{} {}",
        fetched.mime(),
        String::from_utf8_lossy(&fetched.content)
    );
    println!("pool: {:?}", app.stats());

    // (F) 後片付け
    app.end_session(&session).await;
    app.shutdown().await;
    Ok(())
}
