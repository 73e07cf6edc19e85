//! Startup loading, caching and export.
//!
//! Covers the order in which documents come up, serving while later
//! documents are still loading, the cache policy for live and export-only
//! documents, and the artifacts written along the way.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use common::{Fixture, ScriptedEngine, baseline, get, post_bonds, send, write_documents};
use nbstate_core::cache::{DirectoryCache, MemoryCache, StateCache};
use nbstate_core::codec;
use nbstate_core::config::ExportConfig;
use nbstate_core::engine::NotebookEngine;
use nbstate_core::session::Session;
use nbstate_daemon::ServerContext;
use nbstate_daemon::export::{EXPORT_INDEX_FILE, Exporter};
use nbstate_daemon::loader::{LoadSummary, Loader};
use serde_json::json;
use tempfile::TempDir;

fn exporter(out: &TempDir) -> Exporter {
    Exporter::new(
        ExportConfig {
            output_dir: out.path().to_path_buf(),
            ..ExportConfig::default()
        },
        None,
    )
}

// =============================================================================
// Sequential loading
// =============================================================================

#[tokio::test]
async fn failed_document_stays_queued_and_others_run() {
    let fixture = Fixture::queued(&[("a.jl", "a"), ("b.jl", "FAIL"), ("c.jl", "c")]);

    let summary = fixture.loader(Arc::new(MemoryCache::new())).run(&fixture.ctx).await;
    assert_eq!(
        summary,
        LoadSummary {
            running: 2,
            failed: 1,
            exported: 0,
            export_failed: 0,
        }
    );

    let registry = fixture.ctx.registry();
    assert!(registry.get(0).unwrap().is_running());
    assert!(matches!(registry.get(1), Some(Session::Queued { .. })));
    assert!(registry.get(2).unwrap().is_running());
    assert!(!registry.is_ready());

    let response = send(
        fixture.router(),
        post_bonds(&fixture.fingerprint(1), &json!({ "x": 1 })),
    )
    .await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loaded_documents_are_served_while_later_ones_load() {
    let fixture = Fixture::queued(&[("a.jl", "a"), ("b.jl", "b GATE")]);
    let loader = fixture.loader(Arc::new(MemoryCache::new()));
    let ctx = Arc::clone(&fixture.ctx);
    let loading = tokio::spawn(async move { loader.run(&ctx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while fixture.ctx.registry().running_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first document never started running");

    let first = send(
        fixture.router(),
        post_bonds(&fixture.fingerprint(0), &json!({ "x": 1 })),
    )
    .await;
    assert_eq!(first.status, StatusCode::OK);
    let second = send(
        fixture.router(),
        post_bonds(&fixture.fingerprint(1), &json!({ "x": 1 })),
    )
    .await;
    assert_eq!(second.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(send(fixture.router(), get("/")).await.status, StatusCode::SERVICE_UNAVAILABLE);

    fixture.stats().gate.notify_one();
    assert_eq!(loading.await.unwrap().running, 2);

    let second = send(
        fixture.router(),
        post_bonds(&fixture.fingerprint(1), &json!({ "x": 1 })),
    )
    .await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(send(fixture.router(), get("/")).await.status, StatusCode::OK);
}

// =============================================================================
// Cache policy
// =============================================================================

#[tokio::test]
async fn live_documents_always_execute_and_fill_the_cache() {
    let fixture = Fixture::queued(&[("a.jl", "a")]);
    let cache = Arc::new(MemoryCache::new());
    let fp = fixture.documents[0].fingerprint;
    // A cached entry never stands in for a live run.
    cache.put_state(&fp, &json!({ "cell_results": {}, "bonds": {} }));

    fixture.loader(Arc::clone(&cache) as Arc<dyn StateCache>).run(&fixture.ctx).await;

    assert_eq!(fixture.stats().loads(), 1);
    match fixture.ctx.registry().get(0) {
        Some(Session::Running(session)) => assert_eq!(session.baseline(), &baseline()),
        other => panic!("expected running session, got {other:?}"),
    }
}

#[tokio::test]
async fn directory_cache_entries_are_written_on_load() {
    let fixture = Fixture::queued(&[("a.jl", "a")]);
    let cache_dir = TempDir::new().unwrap();
    let cache = Arc::new(DirectoryCache::new(cache_dir.path().join("cache")));

    fixture.loader(Arc::clone(&cache) as Arc<dyn StateCache>).run(&fixture.ctx).await;

    let fp = fixture.documents[0].fingerprint;
    assert!(cache.entry_path(&fp).exists());
    assert_eq!(cache.get_state(&fp), Some(baseline()));
}

#[tokio::test]
async fn export_only_documents_read_the_cache_first() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let mut documents =
        write_documents(src.path(), &[("live.jl", "live"), ("static.jl", "static")]);
    documents[1].export_only = true;
    let cached = json!({ "cell_results": { "y": { "value": "cached" } }, "bonds": {} });

    let cache = Arc::new(MemoryCache::new());
    cache.put_state(&documents[1].fingerprint, &cached);
    let engine = Arc::new(ScriptedEngine::default());
    let ctx = ServerContext::new(documents, None);
    let loader = Loader::new(
        Arc::clone(&engine) as Arc<dyn NotebookEngine>,
        Arc::clone(&cache) as Arc<dyn StateCache>,
        Some(exporter(&out)),
    );

    let summary = loader.run(&ctx).await;
    assert_eq!(summary.running, 1);
    assert_eq!(summary.exported, 2);
    // Only the live document went through the engine.
    assert_eq!(engine.stats.loads(), 1);
    assert_eq!(ctx.registry().len(), 1);

    let html = std::fs::read_to_string(out.path().join("static.html")).unwrap();
    let embedded = STANDARD.encode(codec::serialize_state(&cached).unwrap());
    assert!(html.contains(&embedded));
}

#[tokio::test]
async fn export_only_cache_miss_runs_once_and_fills_the_cache() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let documents = write_documents(src.path(), &[("a.jl", "a"), ("b.jl", "b")]);
    let cache = Arc::new(MemoryCache::new());
    let engine = Arc::new(ScriptedEngine::default());
    let loader = Loader::new(
        Arc::clone(&engine) as Arc<dyn NotebookEngine>,
        Arc::clone(&cache) as Arc<dyn StateCache>,
        Some(exporter(&out)),
    );

    let summary = loader.export_all(&documents).await;
    assert_eq!(summary.exported, 2);
    assert_eq!(engine.stats.loads(), 2);
    assert_eq!(cache.len(), 2);

    // A second export is served entirely from the cache.
    let summary = loader.export_all(&documents).await;
    assert_eq!(summary.exported, 2);
    assert_eq!(engine.stats.loads(), 2);
}

// =============================================================================
// Export artifacts
// =============================================================================

#[tokio::test]
async fn export_writes_pages_and_index_for_running_documents() {
    let fixture = Fixture::queued(&[("a.jl", "a"), ("sub/b.jl", "b"), ("c.jl", "FAIL")]);
    let out = TempDir::new().unwrap();
    let loader = Loader::new(
        Arc::clone(&fixture.engine) as Arc<dyn NotebookEngine>,
        Arc::new(MemoryCache::new()),
        Some(exporter(&out)),
    );

    let summary = loader.run(&fixture.ctx).await;
    assert_eq!(summary.exported, 2);
    assert_eq!(summary.failed, 1);
    assert!(out.path().join("a.html").exists());
    assert!(out.path().join("sub/b.html").exists());
    assert!(!out.path().join("c.html").exists());

    let index: serde_json::Value =
        serde_json::from_slice(&std::fs::read(out.path().join(EXPORT_INDEX_FILE)).unwrap())
            .unwrap();
    let sources: Vec<_> = index
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["source"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(sources, vec!["a.jl", "sub/b.jl"]);
    assert_eq!(index[0]["fingerprint"], fixture.fingerprint(0));
    assert_eq!(index[0]["live"], true);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_gives_up_on_a_busy_session() {
    let fixture = Fixture::queued(&[("a.jl", "a"), ("b.jl", "b")]);
    fixture.load().await;
    let Some(Session::Running(busy_session)) = fixture.ctx.registry().get(0) else {
        panic!("first document is not running");
    };

    let busy = tokio::spawn({
        let router = fixture.router();
        let request = post_bonds(&fixture.fingerprint(0), &json!({ "x": 1, "delay_ms": 10_000 }));
        async move { send(router, request).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while !busy_session.token().is_held() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("recompute never started");

    let started = Instant::now();
    let abandoned = fixture
        .ctx
        .shutdown_sessions(Duration::from_millis(100))
        .await;
    assert_eq!(abandoned, 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!busy.is_finished());
    busy.abort();
}

#[tokio::test]
async fn shutdown_stops_idle_sessions() {
    let fixture = Fixture::queued(&[("a.jl", "a"), ("b.jl", "b")]);
    fixture.load().await;
    assert_eq!(fixture.ctx.shutdown_sessions(Duration::from_secs(1)).await, 0);
}
