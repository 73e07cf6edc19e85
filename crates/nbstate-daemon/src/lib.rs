//! nbstate-daemon - HTTP front end of the notebook state server
//!
//! The daemon discovers documents, loads them into the engine one by one,
//! and answers bond updates with patch sets over HTTP while the rest are
//! still loading.
//!
//! # Modules
//!
//! - [`discovery`]: finding and fingerprinting documents
//! - [`state`]: the context shared by every handler
//! - [`loader`]: sequential startup loading, caching and export
//! - [`export`]: static HTML artifacts
//! - [`handlers`]: request handlers
//! - [`router`]: routes and the CORS and cache header policy
//! - [`error`]: per-request errors and their HTTP mapping

pub mod discovery;
pub mod error;
pub mod export;
pub mod handlers;
pub mod loader;
pub mod router;
pub mod state;

pub use router::router;
pub use state::{ServerContext, SharedContext};
