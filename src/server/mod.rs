use crate::config::Config;
use crate::pipeline::{CacheStatus, Pipeline, PipelineResponse, ProxyRequest};
use crate::upstream::UpstreamClient;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const SESSION_HEADER: &str = "x-session-id";
const SESSION_COOKIE: &str = "golf_session";
const REQUEST_ID_HEADER: &str = "x-request-id";
const CORRELATION_HEADER: &str = "x-correlation-id";

/// Shared state for all routes
struct AppState {
    pipeline: Arc<Pipeline>,
    dev_mode: bool,
}

/// JSON body accepted by `POST /proxy/{endpoint}`
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ProxyPostBody {
    #[serde(default)]
    parameters: HashMap<String, String>,
    #[serde(default)]
    transformations: Vec<String>,
    #[serde(default)]
    cache_override: bool,
}

/// Build the router over a ready pipeline
fn router(pipeline: Arc<Pipeline>, dev_mode: bool) -> Router {
    let state = Arc::new(AppState { pipeline, dev_mode });
    Router::new()
        .route("/proxy/*endpoint", get(proxy_get).post(proxy_post))
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        .with_state(state)
}

/// Run the HTTP server until shutdown
pub async fn run(config: Config) -> anyhow::Result<()> {
    let fetcher = Arc::new(UpstreamClient::new(config.upstream.clone()));
    let pipeline = Arc::new(Pipeline::new(&config, fetcher));

    spawn_background_tasks(Arc::clone(&pipeline));

    let app = router(Arc::clone(&pipeline), config.server.dev_mode);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!("Listening on {}", config.server.bind);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
}

/// Housekeeping sweeps and adaptive rate-limit adjustment run off the
/// request path.
fn spawn_background_tasks(pipeline: Arc<Pipeline>) {
    let sweeper = Arc::clone(&pipeline);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweeper.housekeeping();
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            pipeline.adjust_rate_limits();
        }
    });
}

async fn proxy_get(
    State(state): State<Arc<AppState>>,
    Path(endpoint): Path<String>,
    Query(mut params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let cache_override = params
        .remove("_cache_override")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let request = build_request(&endpoint, params, Vec::new(), cache_override, &headers, addr);
    dispatch(state, request, headers).await
}

async fn proxy_post(
    State(state): State<Arc<AppState>>,
    Path(endpoint): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<ProxyPostBody>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();
    let request = build_request(
        &endpoint,
        body.parameters,
        body.transformations,
        body.cache_override,
        &headers,
        addr,
    );
    dispatch(state, request, headers).await
}

fn build_request(
    endpoint: &str,
    params: HashMap<String, String>,
    transformations: Vec<String>,
    cache_override: bool,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> ProxyRequest {
    ProxyRequest {
        endpoint: endpoint.trim_matches('/').to_string(),
        params,
        session_token: session_token(headers),
        client_ip: client_ip(headers, addr),
        user_agent: header_str(headers, header::USER_AGENT.as_str()).unwrap_or_default(),
        cache_override,
        transformations,
    }
}

async fn dispatch(state: Arc<AppState>, request: ProxyRequest, headers: HeaderMap) -> Response {
    let request_id = header_str(&headers, REQUEST_ID_HEADER)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let correlation_id = header_str(&headers, CORRELATION_HEADER)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let response = state.pipeline.process(request).await;
    render(&state, response, &request_id, &correlation_id)
}

/// Assemble the response envelope and headers from a pipeline response
fn render(
    state: &AppState,
    response: PipelineResponse,
    request_id: &str,
    correlation_id: &str,
) -> Response {
    let mut metadata = json!({
        "requestId": request_id,
        "timestamp": Utc::now().to_rfc3339(),
        "processingTime": response.processing_time.as_millis() as u64,
    });

    if let Some(remaining) = response.rate_limit_remaining {
        metadata["rateLimit"] = json!({
            "remaining": remaining,
            "resetTime": response
                .retry_after
                .map(|d| (Utc::now() + chrono::Duration::seconds(d.as_secs() as i64)).to_rfc3339()),
        });
    }

    let (status, envelope, cache_status) = match response.result {
        Ok(served) => {
            metadata["cached"] = match served.cache_status {
                CacheStatus::Hit => json!(true),
                CacheStatus::Stale => json!("stale"),
                CacheStatus::Miss => json!(false),
            };
            if let Some(age) = served.cache_age {
                metadata["cacheAge"] = json!(age.as_secs());
            }
            if let Some(tier) = served.cache_tier {
                metadata["cacheTier"] = json!(tier);
            }
            if !served.transformations_applied.is_empty() {
                metadata["transformationsApplied"] = json!(served.transformations_applied);
            }

            let data: Value = serde_json::from_slice(&served.body)
                .unwrap_or_else(|_| json!(String::from_utf8_lossy(&served.body)));

            (
                StatusCode::OK,
                json!({ "success": true, "data": data, "metadata": metadata }),
                Some(served.cache_status),
            )
        }
        Err(e) => {
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut error_body = json!({
                "code": e.code(),
                "message": e.sanitized_message(),
            });
            if state.dev_mode {
                error_body["details"] = json!(e.to_string());
            }

            (
                status,
                json!({ "success": false, "error": error_body, "metadata": metadata }),
                None,
            )
        }
    };

    let mut http_response = (status, Json(envelope)).into_response();
    let response_headers = http_response.headers_mut();

    insert_header(response_headers, REQUEST_ID_HEADER, request_id);
    insert_header(response_headers, CORRELATION_HEADER, correlation_id);

    if let Some(cache_status) = cache_status {
        insert_header(response_headers, "x-cache-status", cache_status.header_value());
    }
    if let Some(remaining) = response.rate_limit_remaining {
        insert_header(response_headers, "x-ratelimit-remaining", &remaining.to_string());
    }
    if let Some(retry_after) = response.retry_after {
        insert_header(
            response_headers,
            "retry-after",
            &retry_after.as_secs().max(1).to_string(),
        );
    }
    if let Some(token) = &response.session_token {
        insert_header(response_headers, SESSION_HEADER, token);

        let secure = if state.dev_mode { "" } else { "; Secure" };
        let cookie = format!("{SESSION_COOKIE}={token}; HttpOnly; SameSite=Strict; Path=/{secure}");
        insert_header(response_headers, "set-cookie", &cookie);
    }

    http_response
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let tiers: HashMap<&'static str, _> = state
        .pipeline
        .cache()
        .stats()
        .into_iter()
        .collect();

    Json(json!({
        "status": "ok",
        "circuits": state.pipeline.breaker().states(),
        "cacheTiers": tiers,
    }))
}

async fn metrics_snapshot() -> Json<crate::metrics::MetricsSnapshot> {
    Json(crate::metrics::global().snapshot())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Session token from the header, falling back to the session cookie
fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = header_str(headers, SESSION_HEADER) {
        return Some(token);
    }

    let cookies = header_str(headers, header::COOKIE.as_str())?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Client IP from X-Forwarded-For when fronted by a load balancer,
/// otherwise the socket peer.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
        .unwrap_or_else(|| addr.ip().to_string())
}
