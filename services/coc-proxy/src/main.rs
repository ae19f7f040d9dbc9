//! Clash of Clans key-rotating proxy
//!
//! Single-binary Rust service that:
//! 1. Provisions a pool of game API keys across the configured developer
//!    console accounts, bound to this host's outbound address
//! 2. Listens for `/v1/...` requests
//! 3. Forwards each one upstream with the next key from the pool
//!
//! With `rotator.mode = "shared"` several processes can serve from one pool:
//! WORKER_ID=0 provisions and owns the shared state, every other worker only
//! attaches to it.

mod config;
mod error;
mod metrics;
mod proxy;
mod service;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use coc_console::ConsoleClient;
use coc_keys::{
    AccountProvisioner, OperatorAccount, PoolProvisioner, RotatorState, TokenRotator,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, RotatorMode};
use crate::proxy::ProxyState;
use crate::service::{
    DRAIN_TIMEOUT, Role, ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event,
};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    rotator: Arc<TokenRotator>,
    role: Role,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrent requests; excess requests queue.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/{*path}", get(proxy_handler).post(proxy_handler))
        .fallback(not_found_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting coc-key-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // --- State: Initializing ---
    let mut state = ServiceState::Initializing;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let role = config.role();
    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        role = role.label(),
        worker_id = config.worker_id,
        rotator_mode = ?config.rotator.mode,
        accounts = config.account_count(),
        keys_per_account = config.console.keys_per_account,
        "configuration loaded"
    );

    let rotator = Arc::new(config.build_rotator());

    let (new_state, mut action) = handle_event(
        state,
        ServiceEvent::ConfigLoaded {
            listen_addr: config.proxy.listen_addr,
            role,
        },
    );
    state = new_state;
    info!(?action, "state transition after config load");

    // --- State: Provisioning (initializer only) ---
    if action == ServiceAction::Provision {
        if config.rotator.mode == RotatorMode::Shared {
            // Leftovers from a previous fleet would satisfy workers with stale keys.
            if let Err(e) = coc_keys::remove_shared_state(&config.rotator.state_dir) {
                warn!(error = %e, "failed to clear previous shared state");
            }
        }

        let accounts = config
            .operator_accounts()
            .context("failed to build operator accounts")?;
        let provisioner = PoolProvisioner::new(
            config.address_resolver(),
            AccountProvisioner::new(
                ConsoleClient::new(
                    config.console.base_url.clone(),
                    Duration::from_secs(config.console.timeout_secs),
                ),
                config.retry_policy(),
            ),
            Duration::from_millis(config.console.account_delay_ms),
        );

        action = loop {
            match provision_pool(&provisioner, &accounts, &config, &rotator).await {
                Ok(pool_size) => {
                    metrics::record_provisioning_attempt("success");
                    metrics::set_pool_size(pool_size);
                    let (new_state, action) =
                        handle_event(state, ServiceEvent::PoolReady { pool_size });
                    state = new_state;
                    break action;
                }
                Err(e) => {
                    let (new_state, action) = handle_event(
                        state,
                        ServiceEvent::ProvisioningFailed {
                            error: e.to_string(),
                            retryable: e.is_retryable(),
                        },
                    );
                    state = new_state;

                    match action {
                        ServiceAction::ScheduleRetry { delay } => {
                            metrics::record_provisioning_attempt("retry");
                            warn!(
                                error = %e,
                                retry_in_secs = delay.as_secs(),
                                "provisioning failed, retrying"
                            );
                            tokio::time::sleep(delay).await;

                            // RetryTimer transitions Error -> Provisioning
                            let (new_state, _) = handle_event(state, ServiceEvent::RetryTimer);
                            state = new_state;
                        }
                        ServiceAction::Shutdown { exit_code } => {
                            metrics::record_provisioning_attempt("fatal");
                            error!(error = %e, "provisioning failed, giving up");
                            rotator.teardown();
                            std::process::exit(exit_code);
                        }
                        _ => anyhow::bail!("provisioning failed: {e}"),
                    }
                }
            }
        };
    }

    // --- State: Starting ---
    let listen_addr = match action {
        ServiceAction::StartListener { addr } => addr,
        _ => anyhow::bail!("unexpected action before listener start: {action:?}"),
    };

    if role == Role::Worker && rotator.state() != RotatorState::Ready {
        warn!(
            state_dir = %config.rotator.state_dir.display(),
            "shared pool not written yet, requests fail until the initializer is ready"
        );
    }

    let metrics = ServiceMetrics::new();

    let proxy_state = ProxyState {
        client: reqwest::Client::new(),
        upstream_url: config.proxy.upstream_url.clone(),
        timeout: Duration::from_secs(config.proxy.timeout_secs),
        rotator: rotator.clone(),
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        metrics: metrics.clone(),
        rotator: rotator.clone(),
        role,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    // Transition: Starting -> Running
    let (new_state, _) = handle_event(state, ServiceEvent::ListenerReady);
    state = new_state;
    info!(addr = %listen_addr, pool_size = rotator.pool_size(), "accepting requests");

    // The drain timer starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Transition: Running -> Draining
    let (new_state, _) = handle_event(state, ServiceEvent::ShutdownSignal);
    state = new_state;
    let _ = shutdown_tx.send(());

    let drain_event = match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            ServiceEvent::Drained
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            ServiceEvent::Drained
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            ServiceEvent::Drained
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            ServiceEvent::DrainTimeout
        }
    };

    let (_state, action) = handle_event(state, drain_event);
    rotator.teardown();
    metrics::set_pool_size(0);

    info!(
        requests_served = metrics.requests_total.load(Ordering::Relaxed),
        "shutdown complete"
    );
    match action {
        ServiceAction::Shutdown { exit_code } if exit_code != 0 => std::process::exit(exit_code),
        _ => Ok(()),
    }
}

/// Build the pool and hand it to the rotator.
async fn provision_pool(
    provisioner: &PoolProvisioner,
    accounts: &[OperatorAccount],
    config: &Config,
    rotator: &TokenRotator,
) -> error::Result<usize> {
    let pool = provisioner
        .provision_all(
            accounts,
            &config.console.key_name,
            config.console.keys_per_account,
        )
        .await
        .map_err(error::Error::Provisioning)?;
    let pool_size = pool.len();
    rotator.initialize(pool).map_err(error::Error::Rotator)?;
    Ok(pool_size)
}

/// Health endpoint: JSON with role, rotator state, pool size, uptime and
/// request counters. 200 when the rotator is ready with a nonzero pool,
/// otherwise 503.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let rotator_state = state.rotator.state();
    let pool_size = state.rotator.pool_size();

    let healthy = rotator_state == RotatorState::Ready && pool_size > 0;
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "role": state.role.label(),
        "rotator": rotator_state.label(),
        "rotator_mode": state.rotator.mode(),
        "pool_size": pool_size,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Forwards `/v1/...` to the game API.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = new_request_id();
    proxy::proxy_request(&state.proxy, request, request_id).await
}

async fn not_found_handler(request: axum::http::Request<axum::body::Body>) -> Response {
    proxy::error_response(
        StatusCode::NOT_FOUND,
        &format!("no route for {} {}", request.method(), request.uri().path()),
        &new_request_id(),
    )
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use coc_keys::TokenPool;
    use std::sync::atomic::AtomicU64;
    use tower::ServiceExt;

    /// build_recorder() avoids the "recorder already installed" panic when
    /// several tests run in one process.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn ready_rotator(keys: &[&str]) -> Arc<TokenRotator> {
        let rotator = TokenRotator::in_memory();
        rotator
            .initialize(TokenPool::new(keys.iter().map(|k| (*k).to_owned()).collect()))
            .unwrap();
        Arc::new(rotator)
    }

    fn test_app_state(upstream_url: &str, rotator: Arc<TokenRotator>, timeout: Duration) -> AppState {
        let metrics = ServiceMetrics::new();
        AppState {
            proxy: ProxyState {
                client: reqwest::Client::new(),
                upstream_url: upstream_url.to_string(),
                timeout,
                rotator: rotator.clone(),
                requests_total: metrics.requests_total.clone(),
                errors_total: metrics.errors_total.clone(),
            },
            metrics,
            rotator,
            role: Role::Initializer,
            prometheus: test_prometheus_handle(),
        }
    }

    /// Mock upstream that echoes back request headers, path, query and body.
    async fn start_echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app =
                axum::Router::new().fallback(|request: axum::http::Request<Body>| async move {
                    let mut headers_map = serde_json::Map::new();
                    for (name, value) in request.headers() {
                        headers_map.insert(
                            name.to_string(),
                            serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                        );
                    }
                    let method = request.method().to_string();
                    let path = request.uri().path().to_string();
                    let query = request.uri().query().unwrap_or("").to_string();
                    let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                        .await
                        .unwrap();
                    let body = serde_json::json!({
                        "echoed_headers": headers_map,
                        "method": method,
                        "path": path,
                        "query": query,
                        "body": String::from_utf8_lossy(&body_bytes),
                    });
                    (
                        StatusCode::OK,
                        [("x-upstream-echo", "true"), ("keep-alive", "timeout=5")],
                        axum::Json(body),
                    )
                });
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ready_pool() {
        let state = test_app_state("http://unused", ready_rotator(&["k1", "k2"]), Duration::from_secs(5));
        state.metrics.requests_total.fetch_add(5, Ordering::Relaxed);

        let (status, json) = send(build_router(state, 1000), get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["role"], "initializer");
        assert_eq!(json["rotator"], "ready");
        assert_eq!(json["rotator_mode"], "memory");
        assert_eq!(json["pool_size"], 2);
        assert_eq!(json["requests_served"], 5);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_is_unavailable_before_initialize() {
        let state = test_app_state(
            "http://unused",
            Arc::new(TokenRotator::in_memory()),
            Duration::from_secs(5),
        );

        let (status, json) = send(build_router(state, 1000), get("/health")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["rotator"], "uninitialized");
        assert_eq!(json["pool_size"], 0);
    }

    #[tokio::test]
    async fn health_is_unavailable_with_empty_pool() {
        let state = test_app_state("http://unused", ready_rotator(&[]), Duration::from_secs(5));
        let (status, json) = send(build_router(state, 1000), get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["rotator"], "ready");
    }

    #[tokio::test]
    async fn health_tracks_worker_attaching_to_shared_pool() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(TokenRotator::shared(dir.path()));
        let mut state = test_app_state("http://unused", worker, Duration::from_secs(5));
        state.role = Role::Worker;

        let (status, json) = send(build_router(state.clone(), 1000), get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["role"], "worker");

        TokenRotator::shared(dir.path())
            .initialize(TokenPool::new(vec!["k1".into()]))
            .unwrap();
        let (status, json) = send(build_router(state, 1000), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["rotator_mode"], "shared");
        assert_eq!(json["pool_size"], 1);
    }

    #[tokio::test]
    async fn proxy_rotates_bearer_key_and_hides_client_authorization() {
        let (upstream_url, _server) = start_echo_server().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = test_app_state(&upstream_url, ready_rotator(&["k1", "k2"]), Duration::from_secs(5));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let request = Request::builder()
                .uri("/v1/locations")
                .header("authorization", "Bearer client-secret")
                .header("accept", "text/html")
                .header("x-custom", "preserved")
                .body(Body::empty())
                .unwrap();
            let (status, json) = send(build_router(state.clone(), 1000), request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["path"], "/v1/locations");
            assert_eq!(json["echoed_headers"]["accept"], "application/json");
            assert_eq!(json["echoed_headers"]["x-custom"], "preserved");
            seen.push(json["echoed_headers"]["authorization"].as_str().unwrap().to_owned());
        }

        assert_eq!(seen, ["Bearer k1", "Bearer k2", "Bearer k1"]);
        assert_eq!(state.metrics.requests_total.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn proxy_encodes_tag_segments() {
        let (upstream_url, _server) = start_echo_server().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = test_app_state(&upstream_url, ready_rotator(&["k1"]), Duration::from_secs(5));

        let (status, json) = send(
            build_router(state, 1000),
            get("/v1/players/!2PP0JCCL/battlelog?limit=5"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["path"], "/v1/players/%232PP0JCCL/battlelog");
        assert_eq!(json["query"], "limit=5");
    }

    #[tokio::test]
    async fn post_drops_fields_param_and_forwards_body() {
        let (upstream_url, _server) = start_echo_server().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = test_app_state(&upstream_url, ready_rotator(&["k1"]), Duration::from_secs(5));

        let request = Request::builder()
            .method("POST")
            .uri("/v1/players/%23ABC/verifytoken?fields=name&limit=1")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"token":"t"}"#))
            .unwrap();
        let (status, json) = send(build_router(state, 1000), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/v1/players/%23ABC/verifytoken");
        assert_eq!(json["query"], "limit=1");
        assert_eq!(json["body"], r#"{"token":"t"}"#);
    }

    #[tokio::test]
    async fn get_keeps_fields_param() {
        let (upstream_url, _server) = start_echo_server().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = test_app_state(&upstream_url, ready_rotator(&["k1"]), Duration::from_secs(5));

        let (_, json) = send(build_router(state, 1000), get("/v1/clans?fields=name&limit=1")).await;
        assert_eq!(json["query"], "fields=name&limit=1");
    }

    #[tokio::test]
    async fn proxy_strips_hop_by_hop_headers_both_ways() {
        let (upstream_url, _server) = start_echo_server().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = test_app_state(&upstream_url, ready_rotator(&["k1"]), Duration::from_secs(5));

        let request = Request::builder()
            .uri("/v1/locations")
            .header("connection", "keep-alive")
            .header("te", "trailers")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state, 1000).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("keep-alive").is_none());
        assert_eq!(response.headers()["x-upstream-echo"], "true");
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["echoed_headers"].get("te").is_none());
    }

    #[tokio::test]
    async fn rotator_not_ready_is_internal_error() {
        let state = test_app_state(
            "http://127.0.0.1:1",
            Arc::new(TokenRotator::in_memory()),
            Duration::from_secs(5),
        );
        let errors = state.metrics.errors_total.clone();

        let (status, json) = send(build_router(state, 1000), get("/v1/locations")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"]["type"], "proxy_error");
        assert!(json["error"]["message"].as_str().unwrap().contains("not ready"));
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn proxy_returns_502_for_dead_upstream() {
        let state = test_app_state("http://127.0.0.1:1", ready_rotator(&["k1"]), Duration::from_secs(5));
        let (status, json) = send(build_router(state, 1000), get("/v1/locations")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"]["type"], "proxy_error");
    }

    #[tokio::test]
    async fn proxy_timeout_retries_three_times_then_504() {
        let connections = Arc::new(AtomicU64::new(0));
        let counter = connections.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_url = format!("http://{}", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    // Accept but never answer.
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(socket);
                });
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let rotator = ready_rotator(&["k1", "k2", "k3", "k4"]);
        let state = test_app_state(&upstream_url, rotator.clone(), Duration::from_millis(50));
        let (status, json) = send(build_router(state, 1000), get("/v1/locations")).await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(json["error"]["message"].as_str().unwrap().contains("timeout"));
        assert_eq!(connections.load(Ordering::SeqCst), 3);
        // Each attempt drew a fresh key.
        assert_eq!(rotator.next().unwrap(), "k4");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_app_state("http://unused", ready_rotator(&["k1"]), Duration::from_secs(5));
        let response = build_router(state, 1000).oneshot(get("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let state = test_app_state("http://unused", ready_rotator(&["k1"]), Duration::from_secs(5));
        let (status, json) = send(build_router(state, 1000), get("/v2/anything")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["type"], "proxy_error");
    }

    #[tokio::test]
    async fn concurrency_limit_queues_excess_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_url = format!("http://{}", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let app = axum::Router::new().fallback(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                (StatusCode::OK, "{}")
            });
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = test_app_state(&upstream_url, ready_rotator(&["k1"]), Duration::from_secs(5));
        let app = build_router(state, 1);

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_url = format!("http://{}", front.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(front, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let (r1, r2) = tokio::join!(
            client.get(format!("{front_url}/v1/a")).send(),
            client.get(format!("{front_url}/v1/b")).send()
        );
        assert!(r1.unwrap().status().is_success());
        assert!(r2.unwrap().status().is_success());
    }
}
