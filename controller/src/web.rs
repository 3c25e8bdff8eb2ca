use std::{
    future::IntoFuture,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use fridge_common::{CoolingStatus, HistoryStatus, PowerReading};
use fridge_supervisor::{ota::UpdateStatus, ProcessCtx, ProcessStatus, RestartReason, Supervisor};
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::Instant,
};
use tracing::{info, warn};

use crate::app::{monotonic_ms, AppState, TimeStatus};

const SELF_CHECK_PERIOD: Duration = Duration::from_secs(10);
const SELF_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
const RESTART_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct WebState {
    app: Arc<AppState>,
    supervisor: Arc<Supervisor>,
    /// Registry name the `/healthz` route feeds.
    process: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct ProcessView {
    name: String,
    status: ProcessStatus,
    #[serde(rename = "uptimeSecs")]
    uptime_secs: u64,
    #[serde(rename = "lastHealthAgoMs")]
    last_health_ago_ms: u64,
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(rename = "uptimeSecs")]
    uptime_secs: u64,
    ip: Option<String>,
    version: Option<String>,
    boot: String,
    time: TimeStatus,
    cooling: CoolingStatus,
    history: HistoryStatus,
    power: Option<PowerReading>,
    #[serde(rename = "tasksRunning")]
    tasks_running: usize,
    #[serde(rename = "tasksTotal")]
    tasks_total: usize,
    #[serde(rename = "restartedCount")]
    restarted_count: u64,
    processes: Vec<ProcessView>,
    ota: Option<UpdateStatus>,
}

#[derive(Debug, Serialize)]
struct OtaStatusResponse {
    supported: bool,
    #[serde(flatten)]
    status: Option<UpdateStatus>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: bool,
    message: &'static str,
}

fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/healthz", get(handle_healthz))
        .route("/api/status", get(handle_get_status))
        .route("/api/processes", get(handle_get_processes))
        .route("/api/boost", post(handle_post_boost))
        .route("/api/ota/status", get(handle_get_ota_status))
        .route("/api/ota/check", post(handle_post_ota_check))
        .route("/api/restart", post(handle_post_restart))
        .route("/ota", get(handle_legacy_ota))
        .route("/reboot", get(handle_legacy_reboot))
        .with_state(state)
}

/// The status server as a supervised process.
///
/// Health is fed only from the `/healthz` handler, which a local request reaches every
/// [`SELF_CHECK_PERIOD`]. A server that stops accepting or answering goes stale and is
/// replaced by the monitors.
pub async fn serve(ctx: ProcessCtx, app: Arc<AppState>) -> anyhow::Result<()> {
    let port = app.config.network.http_port;
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;
    info!("status server listening on http://{addr}");
    let local = SocketAddr::from((Ipv4Addr::LOCALHOST, listener.local_addr()?.port()));

    let state = WebState {
        app,
        supervisor: ctx.supervisor().clone(),
        process: ctx.name().to_string(),
    };
    let shutdown = ctx.clone();
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .into_future();

    let heartbeat = async {
        loop {
            tokio::time::sleep(SELF_CHECK_PERIOD).await;
            match tokio::time::timeout(SELF_CHECK_TIMEOUT, self_check(local)).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => warn!("status server self-check got an error status"),
                Ok(Err(err)) => warn!("status server self-check failed: {err}"),
                Err(_) => warn!("status server did not answer within {SELF_CHECK_TIMEOUT:?}"),
            }
        }
    };

    tokio::select! {
        result = server => result.context("status server failed"),
        _ = heartbeat => Ok(()),
    }
}

/// Requests `/healthz` from the server at `addr`; true on a 2xx status line.
async fn self_check(addr: SocketAddr) -> io::Result<bool> {
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;
    let mut status_line = [0u8; 10];
    stream.read_exact(&mut status_line).await?;
    Ok(status_line.starts_with(b"HTTP/1.1 2"))
}

async fn handle_healthz(State(state): State<WebState>) -> StatusCode {
    state.supervisor.registry().feed_health(&state.process);
    StatusCode::NO_CONTENT
}

async fn handle_index(State(state): State<WebState>) -> Html<String> {
    let status = build_status(&state).await;
    let ip = status.ip.unwrap_or_else(|| "unknown".to_string());
    let temperature = status
        .cooling
        .temperature_c
        .map(|temp| format!("{temp:.1} &deg;C"))
        .unwrap_or_else(|| "--".to_string());
    Html(format!(
        r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Fridge Controller</title></head>
<body>
  <h1>Fridge Controller</h1>
  <p>IP: {ip}</p>
  <p>Uptime: {uptime}s</p>
  <p>Temperature: {temperature} ({stage})</p>
  <p>Tasks: {running}/{total}, restarted {restarted}</p>
  <p>Firmware: {version}</p>
  <form method="post" action="/api/ota/check"><button>Check for update</button></form>
  <form method="post" action="/api/restart"><button>Restart</button></form>
</body>
</html>"#,
        uptime = status.uptime_secs,
        stage = status.cooling.stage,
        running = status.tasks_running,
        total = status.tasks_total,
        restarted = status.restarted_count,
        version = status.version.as_deref().unwrap_or("unknown"),
    ))
}

async fn handle_get_status(State(state): State<WebState>) -> impl IntoResponse {
    Json(build_status(&state).await)
}

async fn handle_get_processes(State(state): State<WebState>) -> impl IntoResponse {
    Json(process_views(&state.supervisor))
}

async fn handle_post_boost(State(state): State<WebState>) -> impl IntoResponse {
    state
        .app
        .boost_requested
        .store(true, std::sync::atomic::Ordering::Relaxed);
    accepted("boost requested")
}

async fn handle_get_ota_status(State(state): State<WebState>) -> impl IntoResponse {
    let status = state.app.updater.as_ref().map(|updater| updater.status());
    Json(OtaStatusResponse {
        supported: status.is_some(),
        status,
    })
}

async fn handle_post_ota_check(State(state): State<WebState>) -> axum::response::Response {
    request_update_check(&state)
}

async fn handle_legacy_ota(State(state): State<WebState>) -> axum::response::Response {
    request_update_check(&state)
}

async fn handle_post_restart(State(state): State<WebState>) -> axum::response::Response {
    schedule_restart(&state)
}

async fn handle_legacy_reboot(State(state): State<WebState>) -> axum::response::Response {
    schedule_restart(&state)
}

fn request_update_check(state: &WebState) -> axum::response::Response {
    if state.app.updater.is_none() {
        return error_response(StatusCode::NOT_IMPLEMENTED, "ota is not configured");
    }
    state.app.ota_requests.notify_one();
    accepted("update check queued")
}

/// Responds first; the restart runs detached so it outlives this server.
fn schedule_restart(state: &WebState) -> axum::response::Response {
    let coordinator = state.supervisor.restart().clone();
    tokio::spawn(async move {
        tokio::time::sleep(RESTART_DELAY).await;
        coordinator
            .restart(RestartReason::Requested("web".to_string()))
            .await;
    });
    accepted("restarting")
}

async fn build_status(state: &WebState) -> StatusView {
    let app = &state.app;
    let registry = state.supervisor.registry();
    let (tasks_running, tasks_total) = registry.running_count();
    StatusView {
        uptime_secs: monotonic_ms() / 1_000,
        ip: app.board.local_ip().map(|ip| ip.to_string()),
        version: app.version.clone(),
        boot: format!("{:?}", app.boot_outcome),
        time: app.time_status(),
        cooling: app.cooling.lock().await.status(),
        history: app.history.lock().await.status(),
        power: *app.power.lock().await,
        tasks_running,
        tasks_total,
        restarted_count: registry.restarted_count(),
        processes: process_views(&state.supervisor),
        ota: app.updater.as_ref().map(|updater| updater.status()),
    }
}

fn process_views(supervisor: &Supervisor) -> Vec<ProcessView> {
    let now = Instant::now();
    supervisor
        .registry()
        .snapshot()
        .into_iter()
        .map(|process| ProcessView {
            uptime_secs: now.saturating_duration_since(process.started_at).as_secs(),
            last_health_ago_ms: now
                .saturating_duration_since(process.last_health)
                .as_millis()
                .try_into()
                .unwrap_or(u64::MAX),
            status: process.status,
            name: process.name,
        })
        .collect()
}

fn accepted(message: &'static str) -> axum::response::Response {
    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            accepted: true,
            message,
        }),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
