//! Relevance filtering and structural diffing of notebook state trees.
//!
//! A bond update never ships a full state snapshot. Instead both the
//! session baseline and the freshly recomputed state are projected down to
//! the cells that actually ran (see [`relevance_filter`]) and the two
//! projections are compared with [`diff`]. The resulting [`Patch`] list is
//! what the client applies on top of its own copy of the baseline.
//!
//! # Diff rules
//!
//! - Objects are compared key by key, in sorted key order. Keys missing on
//!   the right become `remove`, new keys become `add`.
//! - Arrays of equal length are compared element by element; arrays whose
//!   length changed are replaced whole.
//! - Differing scalars, or values whose type changed, are replaced.
//!
//! The output is a pure function of its inputs, so identical inputs always
//! produce identical (and identically encoded) patch lists.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::engine::{CellId, NotebookState};

/// Top-level key holding per-cell results in a notebook state tree.
pub const CELL_RESULTS: &str = "cell_results";

/// Top-level key holding the currently bound values in a state tree.
pub const BONDS: &str = "bonds";

/// One step of a path into a state tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Array position.
    Index(usize),
    /// Object key.
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// A path from the root of a state tree.
pub type TreePath = Vec<PathSegment>;

/// A single structural edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Patch {
    /// Insert a value that did not exist before.
    Add {
        /// Location of the new value.
        path: TreePath,
        /// The inserted value.
        value: Value,
    },
    /// Delete an existing value.
    Remove {
        /// Location of the deleted value.
        path: TreePath,
    },
    /// Overwrite an existing value.
    Replace {
        /// Location of the overwritten value.
        path: TreePath,
        /// The new value.
        value: Value,
    },
}

impl Patch {
    /// The path this patch touches.
    #[must_use]
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Add { path, .. } | Self::Remove { path } | Self::Replace { path, .. } => path,
        }
    }
}

/// Errors from applying a patch to a tree that does not fit it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    /// An intermediate path segment does not exist.
    #[error("path not found: {0}")]
    PathNotFound(DisplayPath),

    /// A segment addresses the wrong container kind.
    #[error("type mismatch at {0}")]
    TypeMismatch(DisplayPath),

    /// `remove` with an empty path.
    #[error("cannot remove the root value")]
    RemoveRoot,
}

/// A path formatted as `/a/0/b` for error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayPath(String);

impl DisplayPath {
    fn of(path: &[PathSegment]) -> Self {
        let mut out = String::new();
        for segment in path {
            out.push('/');
            match segment {
                PathSegment::Index(i) => out.push_str(&i.to_string()),
                PathSegment::Key(k) => out.push_str(k),
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        Self(out)
    }
}

impl fmt::Display for DisplayPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Projects a full state snapshot onto what a bond update may reveal.
///
/// The projection keeps only the `cell_results` entries of cells in
/// `ran_ids` and an always-empty `bonds` object. Everything else in the
/// state is dropped. Bond values submitted by one client therefore never
/// reach another client through a response body.
#[must_use]
pub fn relevance_filter(state: &NotebookState, ran_ids: &[CellId]) -> NotebookState {
    let mut kept = Map::new();
    if let Some(results) = state.get(CELL_RESULTS).and_then(Value::as_object) {
        for id in ran_ids {
            if let Some(result) = results.get(id.as_str()) {
                kept.insert(id.clone(), result.clone());
            }
        }
    }

    let mut projection = Map::new();
    projection.insert(CELL_RESULTS.to_string(), Value::Object(kept));
    projection.insert(BONDS.to_string(), Value::Object(Map::new()));
    Value::Object(projection)
}

/// Computes the patch list transforming `before` into `after`.
#[must_use]
pub fn diff(before: &Value, after: &Value) -> Vec<Patch> {
    let mut patches = Vec::new();
    let mut path = Vec::new();
    diff_into(before, after, &mut path, &mut patches);
    patches
}

fn diff_into(before: &Value, after: &Value, path: &mut TreePath, out: &mut Vec<Patch>) {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                path.push(PathSegment::Key(key.clone()));
                match new.get(key) {
                    Some(new_value) => diff_into(old_value, new_value, path, out),
                    None => out.push(Patch::Remove { path: path.clone() }),
                }
                path.pop();
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    let mut added = path.clone();
                    added.push(PathSegment::Key(key.clone()));
                    out.push(Patch::Add {
                        path: added,
                        value: new_value.clone(),
                    });
                }
            }
        },
        (Value::Array(old), Value::Array(new)) if old.len() == new.len() => {
            for (index, (old_value, new_value)) in old.iter().zip(new).enumerate() {
                path.push(PathSegment::Index(index));
                diff_into(old_value, new_value, path, out);
                path.pop();
            }
        },
        _ => {
            if before != after {
                out.push(Patch::Replace {
                    path: path.clone(),
                    value: after.clone(),
                });
            }
        },
    }
}

/// Applies a patch list to `state` in order.
///
/// # Errors
///
/// Returns a [`PatchError`] if a patch addresses a location that does not
/// exist in `state`. Patches before the failing one stay applied.
pub fn apply(state: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        apply_one(state, patch)?;
    }
    Ok(())
}

fn apply_one(state: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let path = patch.path();
    let Some((last, parent_path)) = path.split_last() else {
        return match patch {
            Patch::Add { value, .. } | Patch::Replace { value, .. } => {
                *state = value.clone();
                Ok(())
            },
            Patch::Remove { .. } => Err(PatchError::RemoveRoot),
        };
    };

    let parent = navigate(state, parent_path)?;
    match (parent, last) {
        (Value::Object(map), PathSegment::Key(key)) => match patch {
            Patch::Add { value, .. } | Patch::Replace { value, .. } => {
                map.insert(key.clone(), value.clone());
                Ok(())
            },
            Patch::Remove { .. } => map
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| PatchError::PathNotFound(DisplayPath::of(path))),
        },
        (Value::Array(items), PathSegment::Index(index)) => {
            let index = *index;
            match patch {
                Patch::Add { value, .. } if index <= items.len() => {
                    items.insert(index, value.clone());
                    Ok(())
                },
                Patch::Replace { value, .. } if index < items.len() => {
                    items[index] = value.clone();
                    Ok(())
                },
                Patch::Remove { .. } if index < items.len() => {
                    items.remove(index);
                    Ok(())
                },
                _ => Err(PatchError::PathNotFound(DisplayPath::of(path))),
            }
        },
        _ => Err(PatchError::TypeMismatch(DisplayPath::of(path))),
    }
}

fn navigate<'a>(
    mut node: &'a mut Value,
    path: &[PathSegment],
) -> Result<&'a mut Value, PatchError> {
    for (depth, segment) in path.iter().enumerate() {
        let here = || DisplayPath::of(&path[..=depth]);
        node = match (node, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map
                .get_mut(key)
                .ok_or_else(|| PatchError::PathNotFound(here()))?,
            (Value::Array(items), PathSegment::Index(index)) => items
                .get_mut(*index)
                .ok_or_else(|| PatchError::PathNotFound(here()))?,
            _ => return Err(PatchError::TypeMismatch(here())),
        };
    }
    Ok(node)
}
