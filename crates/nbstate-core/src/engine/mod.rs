//! Interface to the reactive execution engine.
//!
//! The server never evaluates notebook cells itself. It drives an engine
//! through two traits:
//!
//! - [`NotebookEngine`] loads a document and runs it to completion once,
//!   returning a [`LoadedNotebook`].
//! - [`LiveNotebook`] is the exclusively owned handle to one loaded
//!   document. It accepts new bond values and reports which cells re-ran and
//!   the resulting full state.
//!
//! [`process::ProcessEngine`] is the production adapter: one worker process
//! per document, spoken to over line-delimited JSON.

pub mod process;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use process::{ProcessEngine, ProcessEngineConfig};

/// A full notebook state snapshot.
pub type NotebookState = serde_json::Value;

/// Opaque cell identifier assigned by the engine.
pub type CellId = String;

/// Client-submitted bond values keyed by bond name.
pub type BondValues = BTreeMap<String, serde_json::Value>;

/// Maps each bound input name to the variables that depend on it.
pub type BondGraph = BTreeMap<String, BTreeSet<String>>;

/// Errors reported by an execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not be started for a document.
    #[error("failed to start engine for {path}: {message}")]
    Spawn {
        /// Document path.
        path: String,
        /// Underlying cause.
        message: String,
    },

    /// The document failed its initial run.
    #[error("failed to load {path}: {message}")]
    Load {
        /// Document path.
        path: String,
        /// Underlying cause.
        message: String,
    },

    /// Applying bonds and recomputing failed.
    #[error("recompute failed: {0}")]
    Recompute(String),

    /// The engine sent something that does not follow the protocol.
    #[error("engine protocol violation: {0}")]
    Protocol(String),

    /// The engine worker is gone.
    #[error("engine worker exited")]
    WorkerExited,

    /// Engine I/O failed.
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of applying bonds to a live document.
#[derive(Debug, Clone, PartialEq)]
pub struct Recomputed {
    /// Cells that re-ran, in engine order.
    pub ran_ids: Vec<CellId>,
    /// Full state after the recompute.
    pub state: NotebookState,
}

/// A document after its first complete run.
pub struct LoadedNotebook {
    /// Exclusive handle for later recomputes.
    pub live: Box<dyn LiveNotebook>,
    /// The full state right after the first run.
    pub state: NotebookState,
}

impl std::fmt::Debug for LoadedNotebook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedNotebook")
            .field("live", &"<live notebook>")
            .field("state", &self.state)
            .finish()
    }
}

/// Loads documents into the engine.
#[async_trait]
pub trait NotebookEngine: Send + Sync {
    /// Loads the document at `path` and runs every cell once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] or [`EngineError::Load`] if the document
    /// cannot be brought to a fully executed state.
    async fn load(&self, path: &Path) -> Result<LoadedNotebook, EngineError>;
}

/// Exclusive handle to one document running inside the engine.
///
/// Callers serialize access through the session token, so implementations
/// may assume no two calls overlap.
#[async_trait]
pub trait LiveNotebook: Send {
    /// Sets the given bonds and re-runs every dependent cell.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the recompute fails. The document must stay
    /// usable for later calls.
    async fn apply_bonds(&mut self, bonds: BondValues) -> Result<Recomputed, EngineError>;

    /// Which variables depend on each bound input.
    fn bond_graph(&self) -> BondGraph;

    /// Releases engine resources held for this document. Later calls to
    /// [`apply_bonds`](Self::apply_bonds) fail.
    async fn shutdown(&mut self);
}
