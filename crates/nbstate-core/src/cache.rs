//! Content-addressed cache of executed notebook states.
//!
//! Entries are keyed by document [`Fingerprint`]. Because the fingerprint is
//! derived from the source bytes, an entry can never go stale: editing a
//! document changes its fingerprint and the old entry simply stops being
//! looked up. Entries are therefore written once and never overwritten.
//!
//! The cache is an optimization only. Every backend swallows its own I/O
//! failures: a failed read is reported as a miss and a failed write as a
//! no-op, each logged at `warn`.
//!
//! # Backends
//!
//! - [`DirectoryCache`]: one file per entry under a configured directory
//! - [`MemoryCache`]: process-local map, used in tests
//! - [`NoCache`]: always misses, used when caching is disabled

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::codec;
use crate::engine::NotebookState;
use crate::fingerprint::Fingerprint;

/// File extension of cache entries and exported state files.
pub const STATE_FILE_EXTENSION: &str = "nbstate";

/// Storage for encoded state snapshots keyed by fingerprint.
pub trait StateCache: Send + Sync {
    /// Returns the stored blob, or `None` on a miss or read failure.
    fn get(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>>;

    /// Stores a blob unless an entry already exists. Failures are logged and
    /// otherwise ignored.
    fn put(&self, fingerprint: &Fingerprint, blob: &[u8]);

    /// Fetches and decodes a state snapshot. Undecodable entries are misses.
    fn get_state(&self, fingerprint: &Fingerprint) -> Option<NotebookState> {
        let blob = self.get(fingerprint)?;
        match codec::deserialize_state(&blob) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(%fingerprint, error = %e, "discarding undecodable cache entry");
                None
            },
        }
    }

    /// Encodes and stores a state snapshot.
    fn put_state(&self, fingerprint: &Fingerprint, state: &NotebookState) {
        match codec::serialize_state(state) {
            Ok(blob) => self.put(fingerprint, &blob),
            Err(e) => warn!(%fingerprint, error = %e, "state not cacheable"),
        }
    }
}

/// Cache backed by one file per fingerprint in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    dir: PathBuf,
}

impl DirectoryCache {
    /// Creates a cache rooted at `dir`. The directory is created lazily on
    /// the first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory of the cache.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the entry for `fingerprint`.
    #[must_use]
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}.{STATE_FILE_EXTENSION}", fingerprint.to_hex()))
    }

    fn write_entry(&self, path: &Path, blob: &[u8]) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        // Write beside the target then rename, so readers never observe a
        // partially written entry.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(blob)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(path) {
            Ok(_) => Ok(()),
            // Another writer got there first with identical content.
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.error),
        }
    }
}

impl StateCache for DirectoryCache {
    fn get(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        let path = self.entry_path(fingerprint);
        match std::fs::read(&path) {
            Ok(blob) if blob.is_empty() => {
                warn!(path = %path.display(), "ignoring empty cache entry");
                None
            },
            Ok(blob) => {
                debug!(%fingerprint, bytes = blob.len(), "cache hit");
                Some(blob)
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(%fingerprint, "cache miss");
                None
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache read failed, treating as miss");
                None
            },
        }
    }

    fn put(&self, fingerprint: &Fingerprint, blob: &[u8]) {
        let path = self.entry_path(fingerprint);
        if path.exists() {
            return;
        }
        match self.write_entry(&path, blob) {
            Ok(()) => debug!(%fingerprint, path = %path.display(), "cache entry written"),
            Err(e) => warn!(path = %path.display(), error = %e, "cache write failed, skipping"),
        }
    }
}

/// In-memory cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<Fingerprint, Vec<u8>>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateCache for MemoryCache {
    fn get(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }

    fn put(&self, fingerprint: &Fingerprint, blob: &[u8]) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(*fingerprint)
            .or_insert_with(|| blob.to_vec());
    }
}

/// Cache that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl StateCache for NoCache {
    fn get(&self, _fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        None
    }

    fn put(&self, _fingerprint: &Fingerprint, _blob: &[u8]) {}
}
