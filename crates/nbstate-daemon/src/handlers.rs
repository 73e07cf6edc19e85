//! HTTP handlers.
//!
//! Per-document handlers resolve the fingerprint against the registry first.
//! A document that is unknown or still loading is answered without touching
//! the engine, and a failure in one document never blocks another.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use nbstate_core::Fingerprint;
use nbstate_core::codec;
use nbstate_core::diff::{Patch, diff, relevance_filter};
use nbstate_core::engine::CellId;
use nbstate_core::session::{RunningSession, Session};
use serde::Serialize;
use tracing::debug;

use crate::error::StateRequestError;
use crate::state::{ServerContext, SharedContext};

/// Content type of MessagePack bodies.
pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// Cache-Control for responses that are a pure function of the request.
pub const CACHE_IMMUTABLE: &str = "public, max-age=31536000, immutable";

/// Cache-Control for everything else.
pub const CACHE_NO_STORE: &str = "no-store, no-cache, must-revalidate";

/// Body of a successful bond update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateResponse {
    /// Patches taking the relevant part of the baseline to the new state.
    pub patches: Vec<Patch>,
    /// Cells that re-ran.
    pub ran_ids: Vec<CellId>,
}

/// How the bond payload arrived.
#[derive(Debug, Clone, Copy)]
pub enum BondPayload<'a> {
    /// Raw MessagePack request body.
    Body(&'a [u8]),
    /// Base64 of the MessagePack bytes, from a URL path segment.
    Base64(&'a str),
}

impl BondPayload<'_> {
    fn into_bytes(self) -> Result<Vec<u8>, base64::DecodeError> {
        match self {
            Self::Body(bytes) => Ok(bytes.to_vec()),
            Self::Base64(text) => decode_base64(text),
        }
    }
}

/// Decodes URL-safe or standard base64, with or without padding.
fn decode_base64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed = text.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
}

/// Applies a bond update to the document with `fingerprint`.
///
/// Resolves the session, decodes the bonds, waits out the simulated lag,
/// recomputes while holding the document's token, and diffs the relevant
/// parts of the baseline and new state.
///
/// # Errors
///
/// See [`StateRequestError`] for the mapping of each failure.
pub async fn apply_bond_update(
    ctx: &ServerContext,
    fingerprint: &str,
    payload: BondPayload<'_>,
) -> Result<StateResponse, StateRequestError> {
    let session = resolve_running(ctx, fingerprint)?;

    let bonds = payload
        .into_bytes()
        .map_err(|e| e.to_string())
        .and_then(|bytes| codec::deserialize_bonds(&bytes).map_err(|e| e.to_string()))
        .map_err(|reason| StateRequestError::Decode {
            fingerprint: fingerprint.to_string(),
            reason,
        })?;

    if let Some(lag) = ctx.simulated_lag() {
        tokio::time::sleep(lag).await;
    }

    debug!(%fingerprint, bonds = bonds.len(), "applying bonds");
    let recomputed = session
        .apply_bonds(bonds)
        .await
        .map_err(|source| StateRequestError::Recompute {
            fingerprint: fingerprint.to_string(),
            source,
        })?;

    let before = relevance_filter(session.baseline(), &recomputed.ran_ids);
    let after = relevance_filter(&recomputed.state, &recomputed.ran_ids);
    Ok(StateResponse {
        patches: diff(&before, &after),
        ran_ids: recomputed.ran_ids,
    })
}

fn resolve_running(
    ctx: &ServerContext,
    fingerprint: &str,
) -> Result<Arc<RunningSession>, StateRequestError> {
    // A string that is not a fingerprint cannot name a served document.
    let parsed: Fingerprint = fingerprint
        .parse()
        .map_err(|_| StateRequestError::NotFound {
            fingerprint: fingerprint.to_string(),
        })?;
    match ctx.registry().lookup(&parsed) {
        None => Err(StateRequestError::NotFound {
            fingerprint: fingerprint.to_string(),
        }),
        Some(Session::Queued { .. }) => Err(StateRequestError::NotReady {
            fingerprint: fingerprint.to_string(),
        }),
        Some(Session::Running(session)) => Ok(session),
    }
}

fn msgpack_response<T: Serialize>(
    fingerprint: &str,
    value: &T,
) -> Result<Response, StateRequestError> {
    let body = codec::encode(value).map_err(|source| StateRequestError::Encode {
        fingerprint: fingerprint.to_string(),
        source,
    })?;
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, HeaderValue::from_static(MSGPACK_CONTENT_TYPE)),
            (CACHE_CONTROL, HeaderValue::from_static(CACHE_IMMUTABLE)),
        ],
        body,
    )
        .into_response())
}

fn respond(result: Result<Response, StateRequestError>) -> Response {
    match result {
        Ok(response) => response,
        Err(e) => {
            e.log();
            e.into_response()
        },
    }
}

/// `POST /staterequest/{fingerprint}/` with MessagePack bonds as the body.
///
/// A body that cannot be read, including one over the size limit, is a
/// decode failure like any other unreadable payload.
pub async fn state_request_post(
    State(ctx): State<SharedContext>,
    Path(fingerprint): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let result = match body {
        Ok(body) => apply_bond_update(&ctx, &fingerprint, BondPayload::Body(&body)).await,
        Err(rejection) => resolve_running(&ctx, &fingerprint).and_then(|_| {
            Err(StateRequestError::Decode {
                fingerprint: fingerprint.clone(),
                reason: rejection.body_text(),
            })
        }),
    };
    respond(result.and_then(|response| msgpack_response(&fingerprint, &response)))
}

/// `GET /staterequest/{fingerprint}/{payload}` with base64 bonds as the rest
/// of the path.
pub async fn state_request_get(
    State(ctx): State<SharedContext>,
    Path((fingerprint, payload)): Path<(String, String)>,
) -> Response {
    respond(
        apply_bond_update(&ctx, &fingerprint, BondPayload::Base64(&payload))
            .await
            .and_then(|response| msgpack_response(&fingerprint, &response)),
    )
}

/// `GET /bondconnections/{fingerprint}/`: the document's bond graph.
pub async fn bond_connections(
    State(ctx): State<SharedContext>,
    Path(fingerprint): Path<String>,
) -> Response {
    respond(
        resolve_running(&ctx, &fingerprint)
            .and_then(|session| msgpack_response(&fingerprint, session.bond_graph())),
    )
}

/// `GET /`: 200 once every live document is running, 503 before that.
pub async fn readiness(State(ctx): State<SharedContext>) -> Response {
    let registry = ctx.registry();
    if registry.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!(
                "loading: {} of {} notebooks ready",
                registry.running_count(),
                registry.len()
            ),
        )
            .into_response()
    }
}

/// One row of `GET /index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    /// Path relative to the notebooks directory, with `/` separators.
    pub path: String,
    /// Content fingerprint.
    pub fingerprint: Fingerprint,
    /// `queued`, `running` or `export_only`.
    pub status: &'static str,
}

/// Lists every discovered document and its session status.
#[must_use]
pub fn index_entries(ctx: &ServerContext) -> Vec<IndexEntry> {
    let live = ctx
        .live_documents()
        .iter()
        .zip(ctx.registry().sessions())
        .map(|(doc, session)| IndexEntry {
            path: slash_path(&doc.relative),
            fingerprint: doc.fingerprint,
            status: if session.is_running() {
                "running"
            } else {
                "queued"
            },
        });
    let export_only = ctx.export_only_documents().iter().map(|doc| IndexEntry {
        path: slash_path(&doc.relative),
        fingerprint: doc.fingerprint,
        status: "export_only",
    });

    let mut entries: Vec<_> = live.chain(export_only).collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

/// `GET /index.json`.
pub async fn index(State(ctx): State<SharedContext>) -> Json<Vec<IndexEntry>> {
    Json(index_entries(&ctx))
}

/// Fallback for unknown routes.
pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Renders a relative path with forward slashes on every platform.
pub(crate) fn slash_path(path: &std::path::Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
