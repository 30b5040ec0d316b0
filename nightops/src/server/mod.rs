//! HTTP RPC surface of the operations daemon.
//!
//! Thin JSON-over-HTTP layer over [`OperationsDaemon`]: each route checks
//! the caller's source address against the config whitelists, then delegates
//! to the daemon's command methods (which serialize through the command
//! try-lock). Control violations get `InvalidControlIP`; pipeline
//! notifications from unknown hosts are ignored with a null response.

use crate::command::CommandStatus;
use crate::daemon::OperationsDaemon;
use axum::extract::{ConnectInfo, Json, State};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Wire shape of every command reply.
#[derive(Clone, Debug, Serialize)]
pub struct CommandResponse {
    pub code: i32,
    pub message: String,
    /// Validation messages; present only for schedule commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl From<CommandStatus> for CommandResponse {
    fn from(status: CommandStatus) -> Self {
        Self {
            code: status.code(),
            message: status.message().to_string(),
            errors: None,
        }
    }
}

impl CommandResponse {
    fn with_errors(status: CommandStatus, errors: Vec<String>) -> Self {
        Self {
            errors: (!errors.is_empty()).then_some(errors),
            ..Self::from(status)
        }
    }
}

/// Body of the dome/telescope control routes.
#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub auto: bool,
}

/// Body of the processed-frame notification.
#[derive(Debug, Deserialize)]
pub struct FrameNotification {
    pub headers: Value,
}

/// Body of the guide-profile notification. The profiles travel as plain
/// JSON number arrays and become `Vec<f64>` here at the boundary.
#[derive(Debug, Deserialize)]
pub struct GuideProfileNotification {
    pub headers: Value,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

/// Builds the RPC router over the shared daemon state.
pub fn router(daemon: Arc<OperationsDaemon>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/dome/control", post(dome_control))
        .route("/dome/clear_window", post(clear_dome_window))
        .route("/telescope/control", post(tel_control))
        .route("/telescope/stop", post(stop_telescope))
        .route("/schedule", post(schedule_observations))
        .route("/pipeline/frame", post(notify_frame))
        .route("/pipeline/guide_profile", post(notify_guide_profile))
        .with_state(daemon)
}

fn is_control(daemon: &OperationsDaemon, addr: SocketAddr) -> bool {
    daemon.config().control_ips().contains(&addr.ip())
}

fn is_pipeline(daemon: &OperationsDaemon, addr: SocketAddr) -> bool {
    daemon.config().pipeline_ips().contains(&addr.ip())
}

async fn status(State(daemon): State<Arc<OperationsDaemon>>) -> Json<Value> {
    Json(daemon.status_payload())
}

async fn dome_control(
    State(daemon): State<Arc<OperationsDaemon>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<ControlRequest>,
) -> Json<CommandResponse> {
    if !is_control(&daemon, addr) {
        warn!("rejected dome control from {addr}");
        return Json(CommandStatus::InvalidControlIP.into());
    }
    Json(daemon.dome_control(request.auto).await.into())
}

async fn tel_control(
    State(daemon): State<Arc<OperationsDaemon>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<ControlRequest>,
) -> Json<CommandResponse> {
    if !is_control(&daemon, addr) {
        warn!("rejected telescope control from {addr}");
        return Json(CommandStatus::InvalidControlIP.into());
    }
    Json(daemon.tel_control(request.auto).await.into())
}

async fn stop_telescope(
    State(daemon): State<Arc<OperationsDaemon>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Json<CommandResponse> {
    if !is_control(&daemon, addr) {
        warn!("rejected telescope stop from {addr}");
        return Json(CommandStatus::InvalidControlIP.into());
    }
    Json(daemon.stop_telescope().await.into())
}

async fn clear_dome_window(
    State(daemon): State<Arc<OperationsDaemon>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Json<CommandResponse> {
    if !is_control(&daemon, addr) {
        warn!("rejected window clear from {addr}");
        return Json(CommandStatus::InvalidControlIP.into());
    }
    Json(daemon.clear_dome_window().await.into())
}

async fn schedule_observations(
    State(daemon): State<Arc<OperationsDaemon>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(schedule): Json<Value>,
) -> Json<CommandResponse> {
    if !is_control(&daemon, addr) {
        warn!("rejected schedule from {addr}");
        return Json(CommandStatus::InvalidControlIP.into());
    }
    let (status, errors) = daemon.schedule_observations(&schedule).await;
    Json(CommandResponse::with_errors(status, errors))
}

async fn notify_frame(
    State(daemon): State<Arc<OperationsDaemon>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(notification): Json<FrameNotification>,
) -> Json<Value> {
    if !is_pipeline(&daemon, addr) {
        warn!("ignored frame notification from {addr}");
        return Json(Value::Null);
    }
    Json(daemon.notify_processed_frame(&notification.headers))
}

async fn notify_guide_profile(
    State(daemon): State<Arc<OperationsDaemon>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(notification): Json<GuideProfileNotification>,
) -> Json<Value> {
    if !is_pipeline(&daemon, addr) {
        warn!("ignored guide profile from {addr}");
        return Json(Value::Null);
    }
    Json(daemon.notify_guide_profile(&notification.headers, &notification.x, &notification.y))
}
