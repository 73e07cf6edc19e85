//! Shared fixtures for daemon integration tests.
//!
//! [`ScriptedEngine`] stands in for the execution engine. Every document it
//! loads has three cells: `x_cell`, `y` (driven by bond `x`) and `z`. Source
//! text steers its behavior:
//!
//! - `FAIL` anywhere in the source makes the load fail
//! - `GATE` makes the load wait for [`EngineStats::gate`]
//!
//! Bond mappings steer recomputes: `fail` makes the recompute fail and
//! `delay_ms` holds the document for that long. Submitted bonds are echoed
//! into the returned state so tests can check they never reach a response.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use nbstate_core::Fingerprint;
use nbstate_core::cache::{NoCache, StateCache};
use nbstate_core::engine::{
    BondGraph, BondValues, EngineError, LiveNotebook, LoadedNotebook, NotebookEngine,
    NotebookState, Recomputed,
};
use nbstate_daemon::discovery::Document;
use nbstate_daemon::loader::Loader;
use nbstate_daemon::{ServerContext, SharedContext};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::ServiceExt;

// =============================================================================
// Scripted engine
// =============================================================================

/// Observations shared between the engine, its documents and the test.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Completed loads.
    pub loads: AtomicUsize,
    /// Recomputes currently executing, across all documents.
    pub in_flight: AtomicUsize,
    /// Highest value `in_flight` ever reached.
    pub max_in_flight: AtomicUsize,
    /// Values of bond `x` in the order they were applied.
    pub applied: Mutex<Vec<i64>>,
    /// Releases one `GATE` load per permit.
    pub gate: Notify,
}

impl EngineStats {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<i64> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Engine whose documents follow the fixed script above.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    pub stats: Arc<EngineStats>,
}

/// The state every document has right after loading.
pub fn baseline() -> NotebookState {
    json!({
        "cell_results": {
            "x_cell": { "value": 0 },
            "y": { "value": 1 },
            "z": { "value": "static" },
        },
        "bonds": {},
    })
}

#[async_trait]
impl NotebookEngine for ScriptedEngine {
    async fn load(&self, path: &Path) -> Result<LoadedNotebook, EngineError> {
        let source = tokio::fs::read_to_string(path).await?;
        if source.contains("GATE") {
            self.stats.gate.notified().await;
        }
        if source.contains("FAIL") {
            return Err(EngineError::Load {
                path: path.display().to_string(),
                message: "cell x_cell threw".to_string(),
            });
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        Ok(LoadedNotebook {
            live: Box::new(ScriptedNotebook {
                stats: Arc::clone(&self.stats),
            }),
            state: baseline(),
        })
    }
}

struct ScriptedNotebook {
    stats: Arc<EngineStats>,
}

#[async_trait]
impl LiveNotebook for ScriptedNotebook {
    async fn apply_bonds(&mut self, bonds: BondValues) -> Result<Recomputed, EngineError> {
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(ms) = bonds.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let result = if bonds.contains_key("fail") {
            Err(EngineError::Recompute("cell y threw".to_string()))
        } else {
            let x = bonds.get("x").and_then(Value::as_i64).unwrap_or(0);
            self.stats
                .applied
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(x);
            let mut state = baseline();
            state["cell_results"]["y"]["value"] = json!(x + 1);
            state["bonds"] = json!(bonds);
            Ok(Recomputed {
                ran_ids: vec!["y".to_string()],
                state,
            })
        };

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn bond_graph(&self) -> BondGraph {
        let mut graph = BondGraph::new();
        graph.insert("x".to_string(), ["y".to_string()].into_iter().collect());
        graph
    }

    async fn shutdown(&mut self) {}
}

// =============================================================================
// Documents and contexts
// =============================================================================

/// Writes `sources` under `dir` and describes them as live documents.
pub fn write_documents(dir: &Path, sources: &[(&str, &str)]) -> Vec<Document> {
    sources
        .iter()
        .map(|(relative, source)| {
            let path = dir.join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, source).unwrap();
            Document {
                path,
                relative: relative.into(),
                fingerprint: Fingerprint::of_bytes(source.as_bytes()),
                export_only: false,
            }
        })
        .collect()
}

/// A context over `sources` whose sessions are all still queued.
pub struct Fixture {
    pub dir: TempDir,
    pub ctx: SharedContext,
    pub engine: Arc<ScriptedEngine>,
    pub documents: Vec<Document>,
}

impl Fixture {
    pub fn queued(sources: &[(&str, &str)]) -> Self {
        Self::with_lag(sources, None)
    }

    pub fn with_lag(sources: &[(&str, &str)], lag: Option<Duration>) -> Self {
        let dir = TempDir::new().unwrap();
        let documents = write_documents(dir.path(), sources);
        let ctx = Arc::new(ServerContext::new(documents.clone(), lag));
        Self {
            dir,
            ctx,
            engine: Arc::new(ScriptedEngine::default()),
            documents,
        }
    }

    /// Runs the loader over every live document.
    pub async fn load(&self) {
        self.loader(Arc::new(NoCache)).run(&self.ctx).await;
    }

    pub fn loader(&self, cache: Arc<dyn StateCache>) -> Loader {
        Loader::new(
            Arc::clone(&self.engine) as Arc<dyn NotebookEngine>,
            cache,
            None,
        )
    }

    pub fn stats(&self) -> &EngineStats {
        &self.engine.stats
    }

    pub fn fingerprint(&self, index: usize) -> String {
        self.documents[index].fingerprint.to_hex()
    }

    pub fn router(&self) -> Router {
        nbstate_daemon::router(Arc::clone(&self.ctx))
    }
}

// =============================================================================
// HTTP helpers
// =============================================================================

/// A response with its body collected.
#[derive(Debug)]
pub struct Collected {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Collected {
    /// Decodes a MessagePack body.
    pub fn msgpack(&self) -> Value {
        rmp_serde::from_slice(&self.body).unwrap()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn send(router: Router, request: Request<Body>) -> Collected {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    Collected {
        status,
        headers,
        body,
    }
}

pub fn msgpack(value: &Value) -> Vec<u8> {
    rmp_serde::to_vec_named(value).unwrap()
}

pub fn post_bonds(fingerprint: &str, bonds: &Value) -> Request<Body> {
    Request::post(format!("/staterequest/{fingerprint}/"))
        .body(Body::from(msgpack(bonds)))
        .unwrap()
}

pub fn get(uri: impl AsRef<str>) -> Request<Body> {
    Request::get(uri.as_ref()).body(Body::empty()).unwrap()
}
