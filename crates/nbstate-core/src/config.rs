//! Configuration parsing.
//!
//! The daemon reads a single TOML file. Every section and field is optional;
//! an empty file yields [`NbstateConfig::default`]. Unknown keys are
//! rejected so that typos fail loudly at startup instead of silently falling
//! back to defaults.
//!
//! ```toml
//! [server]
//! port = 2345
//! simulated_lag_ms = 250
//!
//! [notebooks]
//! dir = "notebooks"
//! exclude = ["**/drafts/**"]
//!
//! [engine]
//! command = ["julia", "--project", "engine.jl"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::ProcessEngineConfig;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The TOML is invalid or has unknown keys.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization failed.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values parse but do not make sense together.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NbstateConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Document discovery.
    #[serde(default)]
    pub notebooks: NotebooksConfig,

    /// State cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Static export.
    #[serde(default)]
    pub export: ExportConfig,

    /// Execution engine.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl NbstateConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, has unknown keys, or fails
    /// validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.notebooks.extensions.is_empty() {
            return Err(ConfigError::Validation(
                "notebooks.extensions must list at least one extension".to_string(),
            ));
        }
        if let Some(ext) = self
            .notebooks
            .extensions
            .iter()
            .find(|ext| ext.is_empty() || ext.starts_with('.'))
        {
            return Err(ConfigError::Validation(format!(
                "notebooks.extensions entries are bare extensions like \"jl\", got {ext:?}"
            )));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Fixed delay inserted before every recompute, in milliseconds.
    ///
    /// A testing aid for simulating slow engines; `0` disables it.
    #[serde(default)]
    pub simulated_lag_ms: u64,

    /// Public URL of this server, recorded in exported artifacts so they can
    /// reach the bond-update endpoints.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl ServerConfig {
    /// The simulated lag as a duration, if enabled.
    #[must_use]
    pub const fn simulated_lag(&self) -> Option<Duration> {
        if self.simulated_lag_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.simulated_lag_ms))
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            simulated_lag_ms: 0,
            public_url: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    2345
}

/// Document discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotebooksConfig {
    /// Root directory scanned for documents.
    #[serde(default = "default_notebooks_dir")]
    pub dir: PathBuf,

    /// File extensions treated as documents, without the dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Glob patterns, relative to `dir`, of documents to ignore entirely.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Glob patterns of documents that are exported but not served live.
    #[serde(default)]
    pub export_only: Vec<String>,
}

impl Default for NotebooksConfig {
    fn default() -> Self {
        Self {
            dir: default_notebooks_dir(),
            extensions: default_extensions(),
            exclude: Vec::new(),
            export_only: Vec::new(),
        }
    }
}

fn default_notebooks_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_extensions() -> Vec<String> {
    vec!["jl".to_string()]
}

/// State cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Whether the cache is used at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding cache entries.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".nbstate-cache")
}

/// Static export settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    /// Whether artifacts are written.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Output directory, mirroring the notebooks directory layout.
    #[serde(default = "default_export_dir")]
    pub output_dir: PathBuf,

    /// Embed the baseline state in the HTML instead of a sibling file.
    #[serde(default = "default_true")]
    pub baked_state: bool,

    /// Embed the source document in the HTML instead of a sibling copy.
    #[serde(default = "default_true")]
    pub baked_notebookfile: bool,

    /// Ship the source so viewers can upgrade to a live session.
    #[serde(default = "default_true")]
    pub offer_live: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: default_export_dir(),
            baked_state: true,
            baked_notebookfile: true,
            offer_live: true,
        }
    }
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("export")
}

/// Execution engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker program and leading arguments; the document path is appended.
    #[serde(default = "default_engine_command")]
    pub command: Vec<String>,

    /// Working directory for workers.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            cwd: None,
        }
    }
}

impl From<&EngineConfig> for ProcessEngineConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            command: config.command.clone(),
            cwd: config.cwd.clone(),
        }
    }
}

fn default_engine_command() -> Vec<String> {
    vec!["nbstate-engine".to_string()]
}

const fn default_true() -> bool {
    true
}
