//! Static export.
//!
//! For every document the exporter writes an HTML page that mirrors the
//! document's position under the notebooks directory. The page carries the
//! fingerprint and either embeds the baseline state and source or points at
//! sibling files. The fingerprint lets a viewer switch to live bond updates
//! against a running server, which is why exported state must be exactly the
//! state that fingerprint's session uses as its baseline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use nbstate_core::Fingerprint;
use nbstate_core::cache::STATE_FILE_EXTENSION;
use nbstate_core::codec::{self, CodecError};
use nbstate_core::config::ExportConfig;
use nbstate_core::engine::NotebookState;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::discovery::Document;
use crate::handlers::slash_path;

/// Name of the manifest written next to the exported pages.
pub const EXPORT_INDEX_FILE: &str = "export_index.json";

/// Errors from writing export artifacts.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Writing an artifact failed.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Target path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The source document could not be read.
    #[error("failed to read {path}: {source}")]
    ReadSource {
        /// Document path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The state could not be encoded.
    #[error("failed to encode state: {0}")]
    Encode(#[from] CodecError),

    /// The manifest could not be serialized.
    #[error("failed to serialize export index: {0}")]
    Index(#[from] serde_json::Error),

    /// Two documents differ only in their source extension.
    #[error(
        "{} and {} would both be exported as {}",
        .first.display(),
        .second.display(),
        .page.display()
    )]
    PageCollision {
        /// The shared page path.
        page: PathBuf,
        /// Document registered first.
        first: PathBuf,
        /// Document that would overwrite it.
        second: PathBuf,
    },
}

/// Record of one exported document, as listed in [`EXPORT_INDEX_FILE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedDocument {
    /// Source path relative to the notebooks directory.
    pub source: String,
    /// HTML page, relative to the output directory.
    pub html: String,
    /// Sibling state file, when the state is not embedded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Sibling source copy, when the source is shipped but not embedded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notebookfile: Option<String>,
    /// Document fingerprint.
    pub fingerprint: Fingerprint,
    /// Whether a live server serves this document.
    pub live: bool,
}

/// Page path for a document, relative to the output directory.
fn page_path(relative: &Path) -> PathBuf {
    relative.with_extension("html")
}

/// Checks that every document gets a page of its own.
///
/// # Errors
///
/// Returns [`ExportError::PageCollision`] for the first pair of documents
/// that would be written to the same page.
pub fn check_page_names(documents: &[Document]) -> Result<(), ExportError> {
    let mut pages: HashMap<PathBuf, &Path> = HashMap::with_capacity(documents.len());
    for doc in documents {
        let page = page_path(&doc.relative);
        if let Some(first) = pages.insert(page.clone(), &doc.relative) {
            return Err(ExportError::PageCollision {
                page,
                first: first.to_path_buf(),
                second: doc.relative.clone(),
            });
        }
    }
    Ok(())
}

/// Writes export artifacts under an output directory.
#[derive(Debug, Clone)]
pub struct Exporter {
    config: ExportConfig,
    public_url: Option<String>,
}

impl Exporter {
    /// Creates an exporter. `public_url` is recorded in pages of live
    /// documents so viewers know where to send bond updates.
    #[must_use]
    pub const fn new(config: ExportConfig, public_url: Option<String>) -> Self {
        Self { config, public_url }
    }

    /// The directory artifacts are written to.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Writes the page for `doc` and any sibling files.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] if the source cannot be read, the state cannot
    /// be encoded, or an artifact cannot be written.
    pub async fn export(
        &self,
        doc: &Document,
        state: &NotebookState,
        live: bool,
    ) -> Result<ExportedDocument, ExportError> {
        let html_rel = page_path(&doc.relative);
        let state_bytes = codec::serialize_state(state)?;

        let mut record = ExportedDocument {
            source: slash_path(&doc.relative),
            html: slash_path(&html_rel),
            state: None,
            notebookfile: None,
            fingerprint: doc.fingerprint,
            live,
        };

        let state_embed = if self.config.baked_state {
            Some(STANDARD.encode(&state_bytes))
        } else {
            let state_rel = doc.relative.with_extension(STATE_FILE_EXTENSION);
            self.write(&state_rel, &state_bytes).await?;
            record.state = Some(slash_path(&state_rel));
            None
        };

        let mut source_embed = None;
        if self.config.offer_live {
            let source = tokio::fs::read(&doc.path).await.map_err(|source| {
                ExportError::ReadSource {
                    path: doc.path.clone(),
                    source,
                }
            })?;
            if self.config.baked_notebookfile {
                source_embed = Some(STANDARD.encode(&source));
            } else {
                self.write(&doc.relative, &source).await?;
                record.notebookfile = Some(slash_path(&doc.relative));
            }
        }

        let page = Page {
            title: doc
                .relative
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            fingerprint: doc.fingerprint.to_hex(),
            state_url: record.state.as_deref().map(file_name),
            state_base64: state_embed,
            notebookfile_url: record.notebookfile.as_deref().map(file_name),
            notebookfile_base64: source_embed,
            server_url: if live { self.public_url.clone() } else { None },
        };
        self.write(&html_rel, page.render().as_bytes()).await?;

        info!(
            source = %record.source,
            html = %record.html,
            "exported notebook"
        );
        Ok(record)
    }

    /// Writes [`EXPORT_INDEX_FILE`] listing `documents`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] if the manifest cannot be written.
    pub async fn write_index(
        &self,
        documents: &[ExportedDocument],
    ) -> Result<PathBuf, ExportError> {
        let mut sorted = documents.to_vec();
        sorted.sort_by(|a, b| a.source.cmp(&b.source));
        let json = serde_json::to_vec_pretty(&sorted)?;
        self.write(Path::new(EXPORT_INDEX_FILE), &json).await
    }

    async fn write(&self, relative: &Path, contents: &[u8]) -> Result<PathBuf, ExportError> {
        let path = self.config.output_dir.join(relative);
        let map_err = |source| ExportError::Write {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(map_err)?;
        }
        tokio::fs::write(&path, contents).await.map_err(map_err)?;
        Ok(path)
    }
}

/// Sibling files live next to the page, so the page links by file name.
fn file_name(relative: &str) -> String {
    relative.rsplit('/').next().unwrap_or(relative).to_string()
}

struct Page {
    title: String,
    fingerprint: String,
    state_url: Option<String>,
    state_base64: Option<String>,
    notebookfile_url: Option<String>,
    notebookfile_base64: Option<String>,
    server_url: Option<String>,
}

impl Page {
    fn render(&self) -> String {
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<script>
window.nbstate_fingerprint = {fingerprint};
window.nbstate_state_url = {state_url};
window.nbstate_state_base64 = {state_base64};
window.nbstate_notebookfile_url = {notebookfile_url};
window.nbstate_notebookfile_base64 = {notebookfile_base64};
window.nbstate_server_url = {server_url};
</script>
</head>
<body>
<noscript>This notebook needs JavaScript to display.</noscript>
</body>
</html>
"#,
            title = escape_html(&self.title),
            fingerprint = js_value(Some(&self.fingerprint)),
            state_url = js_value(self.state_url.as_deref()),
            state_base64 = js_value(self.state_base64.as_deref()),
            notebookfile_url = js_value(self.notebookfile_url.as_deref()),
            notebookfile_base64 = js_value(self.notebookfile_base64.as_deref()),
            server_url = js_value(self.server_url.as_deref()),
        )
    }
}

/// A JS literal that is safe inside a `<script>` element.
fn js_value(value: Option<&str>) -> String {
    match value {
        None => "null".to_string(),
        Some(text) => serde_json::Value::from(text)
            .to_string()
            .replace("</", "<\\/"),
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
