//! HTTP proxy logic
//!
//! Receives `/v1/...` requests, swaps in the next pool key as the bearer
//! credential, and forwards to the game API. Returns the upstream response
//! verbatim (including error status codes from upstream).

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use coc_keys::TokenRotator;
use tokio::runtime::RuntimeFlavor;
use tracing::{error, instrument, warn};

use crate::metrics::{self, UpstreamError};

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

/// Request headers the proxy sets itself.
const REPLACED_HEADERS: &[&str] = &["host", "authorization", "accept", "content-length"];

/// Query parameter the upstream rejects on POST.
const POST_DROPPED_PARAM: &str = "fields";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
    pub rotator: Arc<TokenRotator>,
    pub requests_total: Arc<std::sync::atomic::AtomicU64>,
    pub errors_total: Arc<std::sync::atomic::AtomicU64>,
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
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Forward one request upstream with the next pool key.
///
/// Upstream timeouts are retried (3 attempts, 100ms apart) with a fresh key
/// each time, then answered with 504. Other transport errors are 502. A
/// rotator failure is 500 and nothing is sent upstream.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let method = request.method().clone();

    let response = forward(state, request, &request_id).await;
    metrics::record_request(response.status(), &method, started.elapsed());
    response
}

async fn forward(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: &str,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let mut upstream_url = format!(
        "{}{}",
        state.upstream_url.trim_end_matches('/'),
        encode_tag_segments(uri.path())
    );
    let query = match uri.query() {
        Some(q) if method == Method::POST => without_param(q, POST_DROPPED_PARAM),
        Some(q) => q.to_owned(),
        None => String::new(),
    };
    if !query.is_empty() {
        upstream_url.push('?');
        upstream_url.push_str(&query);
    }

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        let name_str = name.as_str();
        if !is_hop_by_hop(name_str)
            && !REPLACED_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name_str))
        {
            headers.insert(name.clone(), value.clone());
        }
    }
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
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

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            warn!(attempt, "retrying after upstream timeout");
            tokio::time::sleep(RETRY_DELAY).await;
        }

        let key = match next_key(&state.rotator) {
            Ok(key) => key,
            Err(e) => {
                state.errors_total.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "no key available for request");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("key rotator unavailable: {e}"),
                    request_id,
                );
            }
        };

        let req = state
            .client
            .request(method.clone(), &upstream_url)
            .headers(headers.clone())
            .bearer_auth(key)
            .timeout(state.timeout)
            .body(body_bytes.clone());

        match req.send().await {
            Ok(upstream_response) => {
                let status = upstream_response.status();
                let resp_headers = upstream_response.headers().clone();

                return match upstream_response.bytes().await {
                    Ok(resp_body) => {
                        let mut response = Response::builder().status(status);
                        for (name, value) in &resp_headers {
                            if !is_hop_by_hop(name.as_str()) {
                                response = response.header(name, value);
                            }
                        }
                        response
                            .body(axum::body::Body::from(resp_body))
                            .unwrap_or_else(|e| {
                                error_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    &format!("response build error: {e}"),
                                    request_id,
                                )
                            })
                    }
                    Err(e) => {
                        state.errors_total.fetch_add(1, Ordering::Relaxed);
                        metrics::record_upstream_error(UpstreamError::Body);
                        error!(error = %e, "failed to read upstream response body");
                        error_response(
                            StatusCode::BAD_GATEWAY,
                            &format!("upstream response read error: {e}"),
                            request_id,
                        )
                    }
                };
            }
            Err(e) if e.is_timeout() => {
                metrics::record_upstream_error(UpstreamError::Timeout);
                if attempt + 1 < MAX_ATTEMPTS {
                    continue;
                }
                state.errors_total.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, attempts = MAX_ATTEMPTS, "upstream timeout after all retries");
                return error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    &format!(
                        "upstream timeout after {}s ({MAX_ATTEMPTS} attempts)",
                        state.timeout.as_secs()
                    ),
                    request_id,
                );
            }
            Err(e) => {
                state.errors_total.fetch_add(1, Ordering::Relaxed);
                metrics::record_upstream_error(UpstreamError::Connection);
                error!(error = %e, "upstream request failed");
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("upstream error: {e}"),
                    request_id,
                );
            }
        }
    }

    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "unexpected retry exhaustion",
        request_id,
    )
}

/// Draw the next key. The shared rotator blocks on a cross-process file lock,
/// so on a multi-threaded runtime that wait is moved off the async workers.
fn next_key(rotator: &TokenRotator) -> coc_keys::Result<String> {
    let multi_thread = tokio::runtime::Handle::try_current()
        .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread);
    if rotator.is_shared() && multi_thread {
        tokio::task::block_in_place(|| rotator.next())
    } else {
        rotator.next()
    }
}

/// Percent-encode the tag marker of path segments starting with `#` or `!`.
///
/// Player and clan tags start with `#`, which cannot appear raw in a URL
/// path; clients commonly send `!` instead.
pub fn encode_tag_segments(path: &str) -> String {
    path.split('/')
        .map(|segment| match segment.strip_prefix(['#', '!']) {
            Some(rest) => format!("%23{rest}"),
            None => segment.to_owned(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Drop every `name=...` pair from a raw query string.
pub fn without_param(query: &str, name: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some(name))
        .collect::<Vec<_>>()
        .join("&")
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
