//! Route table and the response header policy.
//!
//! Every response, including errors, preflights and unknown routes, carries
//! permissive CORS headers. Only successful state and bond-connection
//! responses may be cached; everything else is marked `no-store`.

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, CACHE_CONTROL,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use nbstate_core::codec::MAX_BOND_PAYLOAD;

use crate::handlers::{self, CACHE_NO_STORE};
use crate::state::SharedContext;

/// Builds the HTTP router over `ctx`.
pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/", get(handlers::readiness))
        .route("/index.json", get(handlers::index))
        .route(
            "/staterequest/{fingerprint}/",
            post(handlers::state_request_post),
        )
        // Standard base64 may contain `/`, so the payload takes the whole tail.
        .route(
            "/staterequest/{fingerprint}/{*payload}",
            get(handlers::state_request_get),
        )
        .route(
            "/bondconnections/{fingerprint}/",
            get(handlers::bond_connections),
        )
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(MAX_BOND_PAYLOAD))
        .layer(middleware::from_fn(answer_preflight))
        .layer(middleware::map_response(apply_header_policy))
        .with_state(ctx)
}

/// Answers CORS preflight requests on any path without routing them.
async fn answer_preflight(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

async fn apply_header_policy(mut response: Response) -> Response {
    let status = response.status();
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));

    // Handlers opt in to caching; a non-200 never keeps that opt-in.
    if status != StatusCode::OK || !headers.contains_key(CACHE_CONTROL) {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_NO_STORE));
    }
    response
}
