//! Error types for state and bond-connection requests.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use nbstate_core::codec::CodecError;
use nbstate_core::engine::EngineError;
use thiserror::Error;
use tracing::{error, info, warn};

/// Seconds a client should wait before retrying a still-loading document.
const RETRY_AFTER_SECS: &str = "5";

/// Errors that can occur while serving a per-document request.
///
/// Each variant maps to one HTTP status. None of them affect any session
/// other than the one addressed by the request.
#[derive(Debug, Error)]
pub enum StateRequestError {
    /// No served document has this fingerprint. The client's copy of the
    /// document differs from what this server runs and it should reload.
    #[error("no notebook with fingerprint {fingerprint}")]
    NotFound {
        /// Fingerprint as sent by the client.
        fingerprint: String,
    },

    /// The document is known but still loading. Retry later.
    #[error("notebook {fingerprint} is not ready")]
    NotReady {
        /// Document fingerprint.
        fingerprint: String,
    },

    /// The bond payload could not be decoded.
    #[error("failed to decode bonds for {fingerprint}: {reason}")]
    Decode {
        /// Document fingerprint.
        fingerprint: String,
        /// Decoder message.
        reason: String,
    },

    /// The engine failed while applying bonds.
    #[error("recompute failed for {fingerprint}: {source}")]
    Recompute {
        /// Document fingerprint.
        fingerprint: String,
        /// Engine error.
        source: EngineError,
    },

    /// The response body could not be encoded.
    #[error("failed to encode response for {fingerprint}: {source}")]
    Encode {
        /// Document fingerprint.
        fingerprint: String,
        /// Codec error.
        source: CodecError,
    },
}

impl StateRequestError {
    /// Returns the HTTP status code for this error.
    ///
    /// - NotFound: 404 Not Found
    /// - NotReady: 503 Service Unavailable
    /// - Decode, Recompute, Encode: 500 Internal Server Error
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::NotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Decode { .. } | Self::Recompute { .. } | Self::Encode { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }

    /// Logs the error with its fingerprint at a level matching its cause.
    pub fn log(&self) {
        match self {
            Self::NotFound { fingerprint } => {
                info!(%fingerprint, "request for unknown notebook");
            },
            Self::NotReady { fingerprint } => {
                info!(%fingerprint, "request for notebook still loading");
            },
            Self::Decode {
                fingerprint,
                reason,
            } => warn!(%fingerprint, %reason, "rejected malformed bond payload"),
            Self::Recompute {
                fingerprint,
                source,
            } => error!(%fingerprint, error = %source, "recompute failed"),
            Self::Encode {
                fingerprint,
                source,
            } => error!(%fingerprint, error = %source, "response encoding failed"),
        }
    }
}

impl IntoResponse for StateRequestError {
    fn into_response(self) -> Response {
        // Engine and decoder messages stay in the log; clients get a fixed
        // message per kind.
        let status = self.status_code();
        let body = match &self {
            Self::NotFound { .. } => {
                "Not found: this notebook does not match any notebook served here, reload the page"
            },
            Self::NotReady { .. } => "Notebook is still loading, try again shortly",
            Self::Decode { .. } => "Failed to decode bond payload",
            Self::Recompute { .. } => "Failed to recompute notebook",
            Self::Encode { .. } => "Internal server error",
        };

        let mut response = (status, body).into_response();
        if matches!(self, Self::NotReady { .. }) {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}
