//! Dashboard / admin HTTP surface (spec §6, D2): `/`, `/metrics`, `/health`,
//! `/ready`, `/debug/*`, `/events` SSE, and `/api/*` mutation endpoints,
//! Basic-auth gated when `WEB_UI_USER`/`WEB_UI_PASS` are set. Grounded on
//! `Summpot-prism`'s `prism/admin.rs` (an `axum::Router` over a shared
//! `Arc<State>`, one module per concern), the pack's donor for this surface
//! since the teacher has no comparable HTTP control plane.

mod metrics_text;
mod sse;

use std::{net::SocketAddr, time::Instant};

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::app::{
    context::AppContext,
    types::{ClientAddr, KillReason},
};

#[derive(Clone, Derivative)]
#[derivative(Debug)]
struct DashboardState {
    #[derivative(Debug = "ignore")]
    ctx: AppContext,
    started_at: Instant,
}

/// Runs the dashboard until `shutdown` resolves. Grounded on the teacher's
/// `main.rs`, which spawns each collaborator service as its own task driven
/// by the same process lifetime.
pub(crate) async fn run(ctx: AppContext, addr: SocketAddr, shutdown: impl std::future::Future<Output = ()> + Send + 'static) {
    let state = DashboardState {
        ctx: ctx.clone(),
        started_at: Instant::now(),
    };

    let mut app = Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/debug/connections", get(debug_connections))
        .route("/debug/socks5_backends", get(debug_backends))
        .route("/debug/system", get(debug_system))
        .route("/events", get(events))
        .route("/api/conn/kill", post(kill_connection))
        .route("/api/backends/add", post(add_backend))
        .route("/api/backends/remove", post(remove_backend))
        .with_state(state.clone());

    if ctx.env.web_ui_user.is_some() || ctx.env.web_ui_pass.is_some() {
        app = app.layer(middleware::from_fn_with_state(state, basic_auth));
    }

    info!(%addr, "dashboard listening");
    let server = match axum::Server::try_bind(&addr) {
        Ok(builder) => builder.serve(app.into_make_service()),
        Err(err) => {
            warn!(%err, %addr, "dashboard failed to bind, disabling");
            return;
        }
    };
    if let Err(err) = server.with_graceful_shutdown(shutdown).await {
        warn!(%err, "dashboard server exited with error");
    }
}

async fn basic_auth(
    State(state): State<DashboardState>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let expected_user = state.ctx.env.web_ui_user.as_deref().unwrap_or("");
    let expected_pass = state.ctx.env.web_ui_pass.as_deref().unwrap_or("");

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|creds| {
            let (user, pass) = creds.split_once(':')?;
            Some(user == expected_user && pass == expected_pass)
        })
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(header::WWW_AUTHENTICATE, "Basic realm=\"t2s\"")
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::UNAUTHORIZED.into_response())
    }
}

async fn index() -> impl IntoResponse {
    axum::response::Html(include_str!("index.html"))
}

async fn metrics(State(state): State<DashboardState>) -> impl IntoResponse {
    let body = metrics_text::render(&state.ctx);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Readiness is tied to SOCKS availability when at least one backend is
/// configured, matching the "report unready while the pool is fully down"
/// reading of spec §6's `/ready`.
async fn ready(State(state): State<DashboardState>) -> impl IntoResponse {
    let backends = state.ctx.pool.backends();
    let ready = backends.is_empty() || state.ctx.pool.is_available();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "ready": ready })))
}

#[derive(Serialize)]
struct TcpConnectionView {
    conn_id: u64,
    client: String,
    target: String,
    direct: bool,
    bytes_c2r: u64,
    bytes_r2c: u64,
    uptime_secs: f64,
}

#[derive(Serialize)]
struct UdpSessionView {
    client: String,
    target: String,
    direct: bool,
    bytes_c2r: u64,
    bytes_r2c: u64,
    uptime_secs: f64,
}

async fn debug_connections(State(state): State<DashboardState>) -> impl IntoResponse {
    use std::sync::atomic::Ordering::Relaxed;
    let tcp: Vec<_> = state
        .ctx
        .registry
        .tcp_records()
        .into_iter()
        .map(|record| TcpConnectionView {
            conn_id: record.conn_id,
            client: record.client.to_string(),
            target: record.target.to_string(),
            direct: record.is_direct(),
            bytes_c2r: record.bytes_c2r.load(Relaxed),
            bytes_r2c: record.bytes_r2c.load(Relaxed),
            uptime_secs: record.started_at.elapsed().as_secs_f64(),
        })
        .collect();
    let udp: Vec<_> = state
        .ctx
        .registry
        .udp_records()
        .into_iter()
        .map(|record| UdpSessionView {
            client: record.client.to_string(),
            target: record.target.to_string(),
            direct: record.is_direct(),
            bytes_c2r: record.bytes_c2r.load(Relaxed),
            bytes_r2c: record.bytes_r2c.load(Relaxed),
            uptime_secs: record.started_at.elapsed().as_secs_f64(),
        })
        .collect();
    Json(json!({ "tcp": tcp, "udp": udp }))
}

#[derive(Serialize)]
struct BackendView {
    host: String,
    port: u16,
    healthy: bool,
    tier: &'static str,
    server_latency_ms: Option<u32>,
    internet_latency_ms: Option<u32>,
    consecutive_failures: u32,
    ema_bytes_per_second: f64,
    ttl_integrity_percent: Option<u8>,
}

async fn debug_backends(State(state): State<DashboardState>) -> impl IntoResponse {
    let views: Vec<_> = state
        .ctx
        .pool
        .backends()
        .into_iter()
        .map(|backend| {
            let status = backend.status();
            BackendView {
                host: backend.host.clone(),
                port: backend.port,
                healthy: status.healthy,
                tier: match backend.tier() {
                    crate::app::pool::Tier::Green => "green",
                    crate::app::pool::Tier::Yellow => "yellow",
                    crate::app::pool::Tier::Black => "black",
                },
                server_latency_ms: status.server_latency_ms,
                internet_latency_ms: status.internet_latency_ms,
                consecutive_failures: status.consecutive_failures,
                ema_bytes_per_second: status.ema_bytes_per_second,
                ttl_integrity_percent: status.ttl_integrity_percent(),
            }
        })
        .collect();
    Json(json!({
        "backends": views,
        "socks_available": state.ctx.pool.is_available(),
        "bypass_count": state.ctx.pool.bypass_count.load(std::sync::atomic::Ordering::Relaxed),
        "recovered_count": state.ctx.pool.recovered_count.load(std::sync::atomic::Ordering::Relaxed),
    }))
}

async fn debug_system(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs_f64(),
        "tcp_connections_active": state.ctx.registry.tcp_records().len(),
        "udp_sessions_active": state
            .ctx
            .registry
            .counters
            .udp_sessions_active
            .load(std::sync::atomic::Ordering::Relaxed),
    }))
}

async fn events(State(state): State<DashboardState>) -> Sse<impl futures::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>> {
    Sse::new(sse::stream(state.ctx))
}

#[derive(Deserialize)]
struct KillRequest {
    #[serde(default)]
    conn_id: Option<u64>,
    #[serde(default)]
    client: Option<String>,
}

async fn kill_connection(
    State(state): State<DashboardState>,
    Json(req): Json<KillRequest>,
) -> impl IntoResponse {
    if let Some(conn_id) = req.conn_id {
        let killed = state.ctx.registry.kill_tcp(conn_id, KillReason::UiRequested);
        return (StatusCode::OK, Json(json!({ "killed": killed })));
    }
    if let Some(client) = req.client.as_deref() {
        if let Ok(addr) = client.parse::<SocketAddr>() {
            let killed = state.ctx.registry.kill_udp(&ClientAddr(addr), KillReason::UiRequested);
            return (StatusCode::OK, Json(json!({ "killed": killed })));
        }
    }
    (StatusCode::BAD_REQUEST, Json(json!({ "error": "conn_id or client required" })))
}

#[derive(Deserialize)]
struct BackendRequest {
    host: String,
    port: u16,
}

async fn add_backend(
    State(state): State<DashboardState>,
    Json(req): Json<BackendRequest>,
) -> impl IntoResponse {
    state.ctx.pool.add(req.host, req.port);
    (StatusCode::OK, Json(json!({ "ok": true })))
}

async fn remove_backend(
    State(state): State<DashboardState>,
    Json(req): Json<BackendRequest>,
) -> impl IntoResponse {
    let removed = state.ctx.pool.remove(&req.host, req.port);
    (StatusCode::OK, Json(json!({ "removed": removed })))
}
