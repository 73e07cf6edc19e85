//! Startup loading.
//!
//! Live documents are loaded one at a time in registry slot order. Each one
//! is promoted to `Running` as soon as its first run completes, so early
//! documents are served while later ones are still loading. A document
//! that fails to load stays `Queued` and the loader moves on.
//!
//! Live documents always execute: serving bond updates needs a live engine
//! handle, which a cached snapshot cannot provide. The fresh state is then
//! written to the cache. Export-only documents never need a handle, so the
//! cache is consulted first and the engine is only used on a miss.

use std::sync::Arc;

use nbstate_core::cache::StateCache;
use nbstate_core::engine::{EngineError, LoadedNotebook, NotebookEngine, NotebookState};
use nbstate_core::session::{RegistryError, RunningSession};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::discovery::Document;
use crate::export::{ExportedDocument, Exporter};
use crate::state::ServerContext;

/// Why a single document could not be brought up.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The engine could not load the document.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The registry refused the promotion.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Counts reported once loading finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Documents promoted to `Running`.
    pub running: usize,
    /// Documents that failed to load.
    pub failed: usize,
    /// Pages written.
    pub exported: usize,
    /// Pages that could not be written.
    pub export_failed: usize,
}

/// Brings documents up through the engine and hands them to the exporter.
pub struct Loader {
    engine: Arc<dyn NotebookEngine>,
    cache: Arc<dyn StateCache>,
    exporter: Option<Exporter>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("exporter", &self.exporter)
            .finish_non_exhaustive()
    }
}

impl Loader {
    /// Creates a loader. With no exporter, nothing is written to disk
    /// besides cache entries.
    #[must_use]
    pub fn new(
        engine: Arc<dyn NotebookEngine>,
        cache: Arc<dyn StateCache>,
        exporter: Option<Exporter>,
    ) -> Self {
        Self {
            engine,
            cache,
            exporter,
        }
    }

    /// Loads every live document of `ctx` in slot order, then exports the
    /// export-only documents and writes the export index.
    pub async fn run(&self, ctx: &ServerContext) -> LoadSummary {
        let mut summary = LoadSummary::default();
        let mut exported = Vec::new();
        let total = ctx.live_documents().len();

        for (index, doc) in ctx.live_documents().iter().enumerate() {
            info!(
                path = %doc.relative.display(),
                fingerprint = %doc.fingerprint,
                "loading notebook {} of {}",
                index + 1,
                total
            );
            match self.load_live(ctx, index, doc).await {
                Ok(session) => {
                    summary.running += 1;
                    info!(path = %doc.relative.display(), "notebook running");
                    self.export(doc, session.baseline(), true, &mut summary, &mut exported)
                        .await;
                },
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        path = %doc.relative.display(),
                        error = %e,
                        "failed to load notebook, it stays queued"
                    );
                },
            }
        }

        if self.exporter.is_some() {
            for doc in ctx.export_only_documents() {
                self.export_static(doc, &mut summary, &mut exported).await;
            }
        }
        self.finish(&exported, summary).await
    }

    /// Exports `documents` without keeping any of them live.
    pub async fn export_all(&self, documents: &[Document]) -> LoadSummary {
        let mut summary = LoadSummary::default();
        let mut exported = Vec::new();
        for doc in documents {
            self.export_static(doc, &mut summary, &mut exported).await;
        }
        self.finish(&exported, summary).await
    }

    async fn load_live(
        &self,
        ctx: &ServerContext,
        index: usize,
        doc: &Document,
    ) -> Result<Arc<RunningSession>, LoadError> {
        let loaded = self.engine.load(&doc.path).await?;
        self.cache.put_state(&doc.fingerprint, &loaded.state);
        let session = RunningSession::new(doc.fingerprint, doc.path.clone(), loaded);
        Ok(ctx.registry().transition_to_running(index, session)?)
    }

    /// Cache first, engine on a miss. The engine handle is released as soon
    /// as the first run completes.
    async fn static_state(&self, doc: &Document) -> Result<NotebookState, EngineError> {
        if let Some(state) = self.cache.get_state(&doc.fingerprint) {
            debug!(path = %doc.relative.display(), "state cache hit");
            return Ok(state);
        }
        let LoadedNotebook { mut live, state } = self.engine.load(&doc.path).await?;
        live.shutdown().await;
        self.cache.put_state(&doc.fingerprint, &state);
        Ok(state)
    }

    async fn export_static(
        &self,
        doc: &Document,
        summary: &mut LoadSummary,
        exported: &mut Vec<ExportedDocument>,
    ) {
        match self.static_state(doc).await {
            Ok(state) => self.export(doc, &state, false, summary, exported).await,
            Err(e) => {
                summary.failed += 1;
                error!(
                    path = %doc.relative.display(),
                    error = %e,
                    "failed to compute state for export"
                );
            },
        }
    }

    async fn export(
        &self,
        doc: &Document,
        state: &NotebookState,
        live: bool,
        summary: &mut LoadSummary,
        exported: &mut Vec<ExportedDocument>,
    ) {
        let Some(exporter) = &self.exporter else {
            return;
        };
        match exporter.export(doc, state, live).await {
            Ok(record) => {
                summary.exported += 1;
                exported.push(record);
            },
            Err(e) => {
                summary.export_failed += 1;
                warn!(path = %doc.relative.display(), error = %e, "export failed");
            },
        }
    }

    async fn finish(&self, exported: &[ExportedDocument], summary: LoadSummary) -> LoadSummary {
        if let Some(exporter) = &self.exporter {
            match exporter.write_index(exported).await {
                Ok(path) => debug!(path = %path.display(), "export index written"),
                Err(e) => warn!(error = %e, "failed to write export index"),
            }
        }
        info!(
            running = summary.running,
            failed = summary.failed,
            exported = summary.exported,
            export_failed = summary.export_failed,
            "loading finished"
        );
        summary
    }
}
