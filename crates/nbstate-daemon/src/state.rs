//! Shared server context.
//!
//! Every request handler receives the same [`ServerContext`] through axum
//! state. It is built once at startup from the discovered documents and owns
//! the session registry; nothing in the daemon is a process-wide singleton.

use std::sync::Arc;
use std::time::Duration;

use nbstate_core::session::SessionRegistry;
use tracing::warn;

use crate::discovery::Document;

/// Shared context handed to handlers and the loader.
pub type SharedContext = Arc<ServerContext>;

/// Documents, their sessions, and request-path settings.
#[derive(Debug)]
pub struct ServerContext {
    registry: SessionRegistry,
    /// Live documents, index-aligned with the registry slots.
    live: Vec<Document>,
    export_only: Vec<Document>,
    simulated_lag: Option<Duration>,
}

impl ServerContext {
    /// Splits `documents` into live and export-only sets and queues a
    /// session slot for every live document, preserving order.
    #[must_use]
    pub fn new(documents: Vec<Document>, simulated_lag: Option<Duration>) -> Self {
        let (export_only, live): (Vec<_>, Vec<_>) =
            documents.into_iter().partition(|doc| doc.export_only);
        let registry = SessionRegistry::initialize(live.iter().map(|doc| doc.fingerprint));
        Self {
            registry,
            live,
            export_only,
            simulated_lag,
        }
    }

    /// The session registry.
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Documents served live; position `i` is registry slot `i`.
    #[must_use]
    pub fn live_documents(&self) -> &[Document] {
        &self.live
    }

    /// Documents that are exported but never served.
    #[must_use]
    pub fn export_only_documents(&self) -> &[Document] {
        &self.export_only
    }

    /// Delay inserted before each recompute, if configured.
    #[must_use]
    pub const fn simulated_lag(&self) -> Option<Duration> {
        self.simulated_lag
    }

    /// Shuts down every running session's engine handle.
    ///
    /// A session still busy with a recompute after `grace` is left to be
    /// killed with the process. Returns how many sessions were left that way.
    pub async fn shutdown_sessions(&self, grace: Duration) -> usize {
        let sessions: Vec<_> = self.registry.running().collect();
        let mut abandoned = 0;
        for session in sessions {
            if tokio::time::timeout(grace, session.shutdown()).await.is_err() {
                warn!(
                    fingerprint = %session.fingerprint(),
                    path = %session.path().display(),
                    "session still busy at shutdown, abandoning it"
                );
                abandoned += 1;
            }
        }
        abandoned
    }
}
