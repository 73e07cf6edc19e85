//! nbstate-core - session, diff and cache core of the nbstate server
//!
//! This library holds everything the notebook state server needs that is
//! independent of HTTP: identifying documents, tracking their sessions,
//! serializing access to live engine handles, and turning recompute results
//! into minimal patch sets.
//!
//! # Modules
//!
//! - [`fingerprint`]: BLAKE3 content fingerprints, the external document key
//! - [`session`]: `Queued`/`Running` sessions, the slot registry and the
//!   per-document concurrency token
//! - [`diff`]: relevance filtering, structural diff and patch application
//! - [`cache`]: content-addressed state cache with degrade-to-miss semantics
//! - [`codec`]: MessagePack wire and storage encoding
//! - [`engine`]: the execution engine interface and the worker-process
//!   adapter
//! - [`config`]: TOML configuration

pub mod cache;
pub mod codec;
pub mod config;
pub mod diff;
pub mod engine;
pub mod fingerprint;
pub mod session;

pub use fingerprint::Fingerprint;
