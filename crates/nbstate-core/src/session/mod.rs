//! Notebook sessions.
//!
//! A session is the server's view of one served document. It is either
//! [`Session::Queued`] (known by fingerprint, still loading) or
//! [`Session::Running`] (fully executed, accepting bond updates).
//!
//! # Modules
//!
//! - [`registry`]: the fixed, ordered slot table and fingerprint lookup
//! - [`token`]: the per-document lock that serializes recomputes
//!
//! # Invariants
//!
//! - A running session's baseline state and bond graph are captured once, at
//!   load time, and never change.
//! - The live engine handle is owned by the session's token and is only
//!   reachable while holding it.

pub mod registry;
pub mod token;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use registry::{RegistryError, SessionRegistry};
pub use token::ConcurrencyToken;

use crate::engine::{
    BondGraph, BondValues, EngineError, LiveNotebook, LoadedNotebook, NotebookState, Recomputed,
};
use crate::fingerprint::Fingerprint;

/// Exclusive engine handle stored behind a session token.
pub type LiveHandle = Box<dyn LiveNotebook>;

/// Snapshot of one registry slot.
#[derive(Debug, Clone)]
pub enum Session {
    /// Identified but not yet executed.
    Queued {
        /// Document fingerprint.
        fingerprint: Fingerprint,
    },
    /// Executed and serving bond updates.
    Running(Arc<RunningSession>),
}

impl Session {
    /// Fingerprint of the document, whatever the state.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            Self::Queued { fingerprint } => *fingerprint,
            Self::Running(running) => running.fingerprint(),
        }
    }

    /// True for [`Session::Running`].
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }
}

/// A fully executed document.
pub struct RunningSession {
    fingerprint: Fingerprint,
    path: PathBuf,
    baseline: NotebookState,
    bond_graph: BondGraph,
    token: ConcurrencyToken<LiveHandle>,
}

impl RunningSession {
    /// Wraps a freshly loaded notebook.
    ///
    /// The load-time state becomes the permanent diff baseline and the bond
    /// graph is computed here, once.
    #[must_use]
    pub fn new(fingerprint: Fingerprint, path: impl Into<PathBuf>, loaded: LoadedNotebook) -> Self {
        let bond_graph = loaded.live.bond_graph();
        Self {
            fingerprint,
            path: path.into(),
            baseline: loaded.state,
            bond_graph,
            token: ConcurrencyToken::new(loaded.live),
        }
    }

    /// Document fingerprint.
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Path the document was loaded from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// State captured after the first complete run.
    #[must_use]
    pub const fn baseline(&self) -> &NotebookState {
        &self.baseline
    }

    /// Bound input name to dependent variables.
    #[must_use]
    pub const fn bond_graph(&self) -> &BondGraph {
        &self.bond_graph
    }

    /// The token guarding the live handle.
    #[must_use]
    pub const fn token(&self) -> &ConcurrencyToken<LiveHandle> {
        &self.token
    }

    /// Applies bonds under the token and returns the engine's result.
    ///
    /// # Errors
    ///
    /// Propagates the engine's [`EngineError`]. The token is released either
    /// way.
    pub async fn apply_bonds(&self, bonds: BondValues) -> Result<Recomputed, EngineError> {
        self.token
            .with_token(move |live| live.apply_bonds(bonds))
            .await
    }

    /// Shuts the live handle down. Waits for any in-flight recompute.
    pub async fn shutdown(&self) {
        self.token.with_token(|live| live.shutdown()).await;
    }
}

impl fmt::Debug for RunningSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningSession")
            .field("fingerprint", &self.fingerprint)
            .field("path", &self.path)
            .field("bond_graph", &self.bond_graph)
            .finish_non_exhaustive()
    }
}
