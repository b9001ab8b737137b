//! HTTP handlers for the peer surface.
//!
//! Peers fetch byte ranges of locally persisted blobs here. The surface
//! serves only what is already on disk; it never triggers a fetch, so a
//! mesh of nodes cannot cascade misses into each other.
//!
//! Responses:
//! - `206 Partial Content` with `Content-Range` when the range is persisted
//! - `404 Not Found` for unknown keys or unpersisted ranges
//! - `416 Range Not Satisfiable` for ranges invalid against the total

use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use std::time::Instant;
use tracing::debug;

/// Build the peer-surface router.
pub fn app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/v2/blobs/{key}", get(get_blob))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .fallback(fallback_handler)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            track_request,
        ))
        .with_state(state)
}

/// Request logging and metrics middleware
pub async fn track_request(
    State(state): State<AppState>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let method = req.method().to_string();
    debug!(method = %method, uri = %req.uri(), "Received request");

    let started = Instant::now();
    let response = next.run(req).await;

    state
        .metrics
        .http_requests
        .get_or_create(&[
            ("method".to_string(), method.clone()),
            ("status".to_string(), response.status().as_u16().to_string()),
        ])
        .inc();
    state
        .metrics
        .http_duration
        .get_or_create(&[("method".to_string(), method)])
        .observe(started.elapsed().as_secs_f64());

    response
}

/// Fallback handler for unknown routes
pub async fn fallback_handler(uri: axum::http::Uri) -> impl IntoResponse {
    debug!(uri = %uri, "404 - No route found");
    (StatusCode::NOT_FOUND, format!("No route for {}", uri))
}

/// A `Range` header against a file of known total size.
enum RangeSpec {
    /// No (usable) range requested; serve the whole file.
    None,
    /// Inclusive byte positions `[start, end]`.
    Bytes(u64, u64),
    /// Syntactically invalid against the total.
    Invalid,
}

/// Parse a single-range `Range` header.
///
/// Supports RFC 7233 formats `bytes=a-b`, `bytes=a-`, and `bytes=-n`.
/// Multi-range requests are not supported and read as invalid.
fn parse_range(headers: &HeaderMap, total: u64) -> RangeSpec {
    let Some(raw) = headers.get(header::RANGE).and_then(|h| h.to_str().ok()) else {
        return RangeSpec::None;
    };
    let Some(spec) = raw.strip_prefix("bytes=") else {
        return RangeSpec::Invalid;
    };
    if spec.contains(',') || total == 0 {
        return RangeSpec::Invalid;
    }
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeSpec::Invalid;
    };

    let max_end = total - 1;
    if start_str.is_empty() {
        // Suffix range: last n bytes.
        let Ok(suffix_len) = end_str.parse::<u64>() else {
            return RangeSpec::Invalid;
        };
        if suffix_len == 0 {
            return RangeSpec::Invalid;
        }
        return RangeSpec::Bytes(total.saturating_sub(suffix_len), max_end);
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return RangeSpec::Invalid;
    };
    let end = if end_str.is_empty() {
        max_end
    } else {
        match end_str.parse::<u64>() {
            Ok(end) => end.min(max_end),
            Err(_) => return RangeSpec::Invalid,
        }
    };

    if start > end || start >= total {
        return RangeSpec::Invalid;
    }
    RangeSpec::Bytes(start, end)
}

/// Serve a blob (or a range of one) from the local cache.
pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let slot = match state.cache.peek(&key).await {
        Ok(Some(slot)) => slot,
        Ok(None) => return (StatusCode::NOT_FOUND, "Unknown key").into_response(),
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    let Some(total) = slot.size() else {
        return (StatusCode::NOT_FOUND, "Unknown key").into_response();
    };

    if method == Method::HEAD {
        return ([(header::CONTENT_LENGTH, total.to_string())], StatusCode::OK).into_response();
    }

    let (start, end) = match parse_range(&headers, total) {
        RangeSpec::Invalid => {
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{total}"))],
            )
                .into_response();
        }
        RangeSpec::None => {
            if total == 0 {
                return (StatusCode::OK, Vec::new()).into_response();
            }
            (0, total - 1)
        }
        RangeSpec::Bytes(start, end) => (start, end),
    };

    let len = end - start + 1;
    if !slot.range_persisted(start, len) {
        return (StatusCode::NOT_FOUND, "Range not cached").into_response();
    }

    let body = match slot.read_range(start, len as usize).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    state.metrics.bytes_served.inc_by(body.len() as u64);

    if headers.contains_key(header::RANGE) {
        (
            StatusCode::PARTIAL_CONTENT,
            [(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))],
            body,
        )
            .into_response()
    } else {
        (StatusCode::OK, body).into_response()
    }
}

/// Health check endpoint
pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Prometheus metrics endpoint
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.encode(),
    )
}
