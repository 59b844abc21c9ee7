//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop and credential headers, and
//! sends them upstream through the `AuthClient`, which stamps the session's
//! bearer token and refreshes it on expiry. Upstream responses are returned
//! verbatim, including failures that survive the refresh-and-retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use auth_client::{AuthClient, Error as ClientError, Request, TransportError};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, instrument, warn};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers never forwarded: reqwest sets `host` from the upstream URL
/// and the session owns `authorization`.
const CLIENT_ONLY_HEADERS: &[&str] = &["host", "authorization"];

/// Largest request body the proxy buffers.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: AuthClient,
    pub timeout: Duration,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// JSON error response: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Proxy an inbound request upstream with the session's credentials.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    state.in_flight.fetch_add(1, Ordering::Relaxed);

    let response = forward(state, request, &request_id).await;

    state.in_flight.fetch_sub(1, Ordering::Relaxed);
    metrics::record_request(
        response.status().as_u16(),
        &method,
        start.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: &str,
) -> Response {
    let (parts, body) = request.into_parts();

    // Relative URL, resolved against the upstream base by the client
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    let mut headers = HeaderMap::new();
    for (name, value) in &parts.headers {
        if !is_hop_by_hop(name.as_str()) && !is_client_only(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };

    let mut outbound = Request::new(parts.method, path).body(body);
    outbound.headers = headers;

    match state.client.send(outbound).await {
        Ok(upstream) => upstream_response(upstream.status, &upstream.headers, upstream.body),
        Err(e) => failure_response(state, e, request_id),
    }
}

/// Map a terminal client error to the inbound response.
fn failure_response(state: &ProxyState, err: ClientError, request_id: &str) -> Response {
    match err {
        ClientError::Status { .. }
        | ClientError::RefreshUnavailable { .. }
        | ClientError::Expired { .. } => {
            if let ClientError::RefreshUnavailable { ref reason, .. } = err {
                warn!(%reason, "upstream rejected credentials and refresh is unavailable");
            } else if let ClientError::Expired { ref source, .. } = err {
                warn!(error = %source, "upstream rejected credentials and refresh failed");
            }
            match err.into_response() {
                Some(r) => upstream_response(r.status, &r.headers, r.body),
                None => error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "upstream response missing",
                    request_id,
                ),
            }
        }
        ClientError::Transport(TransportError::Timeout(e)) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_upstream_error("timeout");
            error!(error = %e, "upstream timeout");
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                &format!("upstream timeout after {}s", state.timeout.as_secs()),
                request_id,
            )
        }
        ClientError::Transport(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            let error_type = match e {
                TransportError::Connect(_) => "connect",
                _ => "other",
            };
            metrics::record_upstream_error(error_type);
            error!(error = %e, "upstream request failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                &format!("upstream error: {e}"),
                request_id,
            )
        }
        ClientError::InvalidRequest(msg) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            warn!(error = %msg, "rejecting invalid request");
            error_response(StatusCode::BAD_REQUEST, &msg, request_id)
        }
        other => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %other, "proxy failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &other.to_string(),
                request_id,
            )
        }
    }
}

fn upstream_response(status: StatusCode, headers: &HeaderMap, body: bytes::Bytes) -> Response {
    let mut response = Response::new(axum::body::Body::from(body));
    *response.status_mut() = status;
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            response.headers_mut().append(name.clone(), value.clone());
        }
    }
    response
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_client_only(name: &str) -> bool {
    CLIENT_ONLY_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
