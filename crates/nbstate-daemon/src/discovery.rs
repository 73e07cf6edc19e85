//! Document discovery.
//!
//! Walks the notebooks directory, keeps files with a configured extension,
//! drops excluded paths, and fingerprints what remains. The result is sorted
//! by relative path so that registry slot order is stable across restarts.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use nbstate_core::Fingerprint;
use nbstate_core::config::NotebooksConfig;
use thiserror::Error;
use tracing::debug;

/// Errors from scanning the notebooks directory.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The notebooks directory does not exist or is unreadable.
    #[error("notebooks directory {path} is not accessible: {source}")]
    Root {
        /// Configured directory.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// An exclude or export-only pattern is not a valid glob.
    #[error("invalid glob pattern {pattern:?}: {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// Parser error.
        source: globset::Error,
    },

    /// Walking the tree failed.
    #[error("failed to walk notebooks directory: {0}")]
    Walk(#[from] ignore::Error),

    /// A document could not be read for fingerprinting.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Document path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// A document found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Absolute path.
    pub path: PathBuf,
    /// Path relative to the notebooks directory, used for export layout.
    pub relative: PathBuf,
    /// Content fingerprint at discovery time.
    pub fingerprint: Fingerprint,
    /// Exported but never served live.
    pub export_only: bool,
}

/// Scans `config.dir` for documents.
///
/// Hidden files and directories are skipped, as is anything under one of
/// `skip_dirs` (the export and cache directories, so generated copies are
/// never rediscovered).
///
/// # Errors
///
/// Returns [`DiscoveryError`] if the directory is inaccessible, a pattern is
/// invalid, or a matching file cannot be read.
pub fn discover(
    config: &NotebooksConfig,
    skip_dirs: &[PathBuf],
) -> Result<Vec<Document>, DiscoveryError> {
    let root = config
        .dir
        .canonicalize()
        .map_err(|source| DiscoveryError::Root {
            path: config.dir.clone(),
            source,
        })?;
    let exclude = build_globset(&config.exclude)?;
    let export_only = build_globset(&config.export_only)?;
    // Skip directories that do not exist yet cannot contain anything.
    let skip: Vec<PathBuf> = skip_dirs
        .iter()
        .filter_map(|dir| dir.canonicalize().ok())
        .collect();

    let walker = WalkBuilder::new(&root)
        .standard_filters(false)
        .hidden(true)
        .filter_entry(move |entry| !skip.iter().any(|dir| entry.path().starts_with(dir)))
        .build();

    let mut documents = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        if !has_extension(path, &config.extensions) {
            continue;
        }
        let relative = path.strip_prefix(&root).unwrap_or(path).to_path_buf();
        if exclude.is_match(&relative) {
            debug!(path = %relative.display(), "excluded");
            continue;
        }

        let fingerprint = Fingerprint::of_file(path).map_err(|source| DiscoveryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        documents.push(Document {
            path: path.to_path_buf(),
            export_only: export_only.is_match(&relative),
            relative,
            fingerprint,
        });
    }

    documents.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(documents)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, DiscoveryError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| DiscoveryError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| DiscoveryError::Pattern {
        pattern: patterns.join(", "),
        source,
    })
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|wanted| wanted == ext))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn config(root: &Path) -> NotebooksConfig {
        NotebooksConfig {
            dir: root.to_path_buf(),
            ..NotebooksConfig::default()
        }
    }

    fn relatives(documents: &[Document]) -> Vec<String> {
        documents
            .iter()
            .map(|doc| doc.relative.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_discovers_sorted_documents_with_fingerprints() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "b.jl", "b = 1");
        write(tmp.path(), "a.jl", "a = 1");
        write(tmp.path(), "sub/c.jl", "c = 1");
        write(tmp.path(), "notes.txt", "not a notebook");

        let documents = discover(&config(tmp.path()), &[]).unwrap();
        assert_eq!(relatives(&documents), vec!["a.jl", "b.jl", "sub/c.jl"]);
        assert_eq!(documents[0].fingerprint, Fingerprint::of_bytes(b"a = 1"));
        assert!(documents.iter().all(|doc| !doc.export_only));
        assert!(documents.iter().all(|doc| doc.path.is_absolute()));
    }

    #[test]
    fn test_exclude_and_export_only_patterns() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "live.jl", "1");
        write(tmp.path(), "drafts/wip.jl", "2");
        write(tmp.path(), "static/page.jl", "3");

        let mut cfg = config(tmp.path());
        cfg.exclude = vec!["drafts/**".to_string()];
        cfg.export_only = vec!["static/*.jl".to_string()];

        let documents = discover(&cfg, &[]).unwrap();
        assert_eq!(relatives(&documents), vec!["live.jl", "static/page.jl"]);
        assert!(!documents[0].export_only);
        assert!(documents[1].export_only);
    }

    #[test]
    fn test_skips_hidden_and_generated_directories() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "doc.jl", "1");
        write(tmp.path(), ".hidden/secret.jl", "2");
        write(tmp.path(), "export/doc.jl", "1");

        let documents = discover(&config(tmp.path()), &[tmp.path().join("export")]).unwrap();
        assert_eq!(relatives(&documents), vec!["doc.jl"]);
    }

    #[test]
    fn test_missing_root_and_bad_pattern() {
        let tmp = TempDir::new().unwrap();
        let missing = config(&tmp.path().join("missing"));
        assert!(matches!(
            discover(&missing, &[]),
            Err(DiscoveryError::Root { .. })
        ));

        let mut cfg = config(tmp.path());
        cfg.exclude = vec!["[".to_string()];
        assert!(matches!(
            discover(&cfg, &[]),
            Err(DiscoveryError::Pattern { .. })
        ));
    }
}
