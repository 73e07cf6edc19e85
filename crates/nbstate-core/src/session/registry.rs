//! Fixed-length registry of notebook sessions.
//!
//! The registry is built once at startup with one slot per served document,
//! in discovery order. Every slot starts `Queued` and may be promoted to
//! `Running` exactly once; nothing else ever changes. Each slot's running
//! half is a [`OnceLock`], which encodes that rule directly:
//!
//! - reads never take a lock, so lookups from request handlers never wait on
//!   a document that is still loading;
//! - a second promotion of the same slot is rejected;
//! - a `Running` slot can never go back to `Queued`.

use std::sync::{Arc, OnceLock};

use thiserror::Error;

use super::{RunningSession, Session};
use crate::fingerprint::Fingerprint;

/// Errors from promoting a slot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No slot at that index.
    #[error("slot {index} out of range (registry has {len} slots)")]
    OutOfRange {
        /// Requested index.
        index: usize,
        /// Number of slots.
        len: usize,
    },

    /// The running session belongs to a different document.
    #[error("slot {index} holds {expected}, refusing session for {actual}")]
    FingerprintMismatch {
        /// Requested index.
        index: usize,
        /// Fingerprint registered for the slot.
        expected: Fingerprint,
        /// Fingerprint of the offered session.
        actual: Fingerprint,
    },

    /// The slot was already promoted.
    #[error("slot {index} is already running")]
    AlreadyRunning {
        /// Requested index.
        index: usize,
    },
}

#[derive(Debug)]
struct Slot {
    fingerprint: Fingerprint,
    running: OnceLock<Arc<RunningSession>>,
}

impl Slot {
    fn session(&self) -> Session {
        match self.running.get() {
            Some(running) => Session::Running(Arc::clone(running)),
            None => Session::Queued {
                fingerprint: self.fingerprint,
            },
        }
    }
}

/// Ordered collection of session slots.
#[derive(Debug)]
pub struct SessionRegistry {
    slots: Vec<Slot>,
}

impl SessionRegistry {
    /// Creates one `Queued` slot per fingerprint, preserving order.
    #[must_use]
    pub fn initialize(fingerprints: impl IntoIterator<Item = Fingerprint>) -> Self {
        Self {
            slots: fingerprints
                .into_iter()
                .map(|fingerprint| Slot {
                    fingerprint,
                    running: OnceLock::new(),
                })
                .collect(),
        }
    }

    /// Promotes slot `index` to `Running`.
    ///
    /// # Errors
    ///
    /// Fails if the index is out of range, the session's fingerprint differs
    /// from the slot's, or the slot is already running. On failure the
    /// offered session is dropped.
    pub fn transition_to_running(
        &self,
        index: usize,
        session: RunningSession,
    ) -> Result<Arc<RunningSession>, RegistryError> {
        let slot = self.slots.get(index).ok_or(RegistryError::OutOfRange {
            index,
            len: self.slots.len(),
        })?;
        if session.fingerprint() != slot.fingerprint {
            return Err(RegistryError::FingerprintMismatch {
                index,
                expected: slot.fingerprint,
                actual: session.fingerprint(),
            });
        }

        let session = Arc::new(session);
        slot.running
            .set(Arc::clone(&session))
            .map_err(|_| RegistryError::AlreadyRunning { index })?;
        Ok(session)
    }

    /// Returns the session for the first slot matching `fingerprint`.
    #[must_use]
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Session> {
        self.slots
            .iter()
            .find(|slot| slot.fingerprint == *fingerprint)
            .map(Slot::session)
    }

    /// Session at a given slot index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Session> {
        self.slots.get(index).map(Slot::session)
    }

    /// True when every slot is running. An empty registry is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.slots.iter().all(|slot| slot.running.get().is_some())
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if the registry has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of running slots.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.running.get().is_some())
            .count()
    }

    /// All sessions in slot order.
    pub fn sessions(&self) -> impl Iterator<Item = Session> + '_ {
        self.slots.iter().map(Slot::session)
    }

    /// The running sessions, in slot order.
    pub fn running(&self) -> impl Iterator<Item = Arc<RunningSession>> + '_ {
        self.slots
            .iter()
            .filter_map(|slot| slot.running.get().map(Arc::clone))
    }
}
