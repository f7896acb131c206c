/**
 * HTTP API - control surface for panels, CLIs and node agents
 *
 * ROLE: exposes server lifecycle, node inventory and the realtime viewer
 * socket over axum.
 *
 * ROUTES:
 * - /health, /system/health
 * - /servers, /servers/{id}, /servers/{id}/{start|stop|restart|backup}, /servers/{id}/status
 * - /nodes, /nodes/{id}, /nodes/{id}/status
 * - /internal/servers/{id} (ownership lookups from agents)
 * - /ws (viewer WebSocket)
 *
 * SECURITY:
 * - x-api-key required everywhere except /health and /ws; with no key
 *   configured every protected route is refused
 * - x-user-id carries the acting user, issued and checked upstream
 */

use crate::control::{ControlError, ControlSurface, DispatchReceipt};
use crate::health::{HealthTracker, KernelHealth};
use crate::hub::{ws::serve_viewer, Hub};
use crate::models::{Allocation, NewServer, Node, NodeId, NodeStatus, Server, ServerId, ServerStatus, UserId};
use crate::store::StoreError;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use raptor_bus::{CommandAction, MessageBus};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub control: ControlSurface,
    pub hub: Hub,
    pub bus: Arc<dyn MessageBus>,
    pub health_tracker: HealthTracker,
    pub api_key: Option<Arc<str>>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/ws", get(viewer_socket))
        .route("/servers", get(list_servers).post(create_server))
        .route("/servers/{id}", get(get_server).delete(delete_server))
        .route("/servers/{id}/start", post(start_server))
        .route("/servers/{id}/stop", post(stop_server))
        .route("/servers/{id}/restart", post(restart_server))
        .route("/servers/{id}/backup", post(backup_server))
        .route("/servers/{id}/status", get(get_server_status))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{id}", get(get_node))
        .route("/nodes/{id}/status", get(get_node_status))
        .route("/internal/servers/{id}", get(locate_server))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path == "/health" || path == "/ws" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        warn!("no API key configured, refusing {path}");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

/// Caller identity taken from the trusted `x-user-id` header.
#[derive(Debug, Clone, Copy)]
pub struct ActingUser(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for ActingUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .map(ActingUser)
            .ok_or(ApiError(StatusCode::UNAUTHORIZED, "missing or invalid x-user-id".into()))
    }
}

/// `{"error": "..."}` with a status code.
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        let status = match &e {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Store(StoreError::ServerNotFound(_)) | ControlError::Store(StoreError::NodeNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ControlError::Store(StoreError::NoFreeAllocation(_)) => StatusCode::BAD_REQUEST,
            ControlError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::BusUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            error!("request failed: {e}");
        }
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let hub = app.hub.stats().await.ok();
    Json(
        app.health_tracker
            .get_health(app.control.store().as_ref(), hub, app.bus.is_connected()),
    )
}

// GET /ws
async fn viewer_socket(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_viewer(socket, app.hub))
}

// GET /servers
async fn list_servers(State(app): State<AppState>, ActingUser(user): ActingUser) -> Json<Vec<Server>> {
    Json(app.control.servers(user))
}

// POST /servers
async fn create_server(
    State(app): State<AppState>,
    ActingUser(user): ActingUser,
    Json(request): Json<NewServer>,
) -> Result<(StatusCode, Json<Server>), ControlError> {
    let server = app.control.create_server(user, request)?;
    Ok((StatusCode::CREATED, Json(server)))
}

// GET /servers/{id}
async fn get_server(
    State(app): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<ServerId>,
) -> Result<Json<Server>, ControlError> {
    Ok(Json(app.control.server(user, id)?))
}

// DELETE /servers/{id}
async fn delete_server(
    State(app): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<ServerId>,
) -> Result<StatusCode, ControlError> {
    app.control.delete_server(user, id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct CommandAccepted {
    message: String,
    #[serde(flatten)]
    receipt: DispatchReceipt,
}

async fn dispatch(
    app: &AppState,
    user: UserId,
    id: ServerId,
    action: CommandAction,
) -> Result<Json<CommandAccepted>, ControlError> {
    let receipt = app.control.dispatch(user, id, action).await?;
    Ok(Json(CommandAccepted {
        message: format!("Server {action} command sent"),
        receipt,
    }))
}

// POST /servers/{id}/start
async fn start_server(
    State(app): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<ServerId>,
) -> Result<Json<CommandAccepted>, ControlError> {
    dispatch(&app, user, id, CommandAction::Start).await
}

// POST /servers/{id}/stop
async fn stop_server(
    State(app): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<ServerId>,
) -> Result<Json<CommandAccepted>, ControlError> {
    dispatch(&app, user, id, CommandAction::Stop).await
}

// POST /servers/{id}/restart
async fn restart_server(
    State(app): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<ServerId>,
) -> Result<Json<CommandAccepted>, ControlError> {
    dispatch(&app, user, id, CommandAction::Restart).await
}

// POST /servers/{id}/backup
async fn backup_server(
    State(app): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<ServerId>,
) -> Result<Json<CommandAccepted>, ControlError> {
    dispatch(&app, user, id, CommandAction::Backup).await
}

#[derive(Debug, Serialize)]
struct ServerStatusView {
    server_id: ServerId,
    status: ServerStatus,
}

// GET /servers/{id}/status
async fn get_server_status(
    State(app): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<ServerId>,
) -> Result<Json<ServerStatusView>, ControlError> {
    let server = app.control.server(user, id)?;
    Ok(Json(ServerStatusView {
        server_id: server.id,
        status: server.status,
    }))
}

#[derive(Debug, Serialize)]
struct NodeView {
    #[serde(flatten)]
    node: Node,
    allocations: Vec<Allocation>,
}

#[derive(Debug, Serialize)]
struct NodeStatusView {
    status: NodeStatus,
    used_ram: u64,
    total_ram: u64,
    used_cpu: u64,
    total_cpu: u64,
}

fn node_not_found(id: NodeId) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, StoreError::NodeNotFound(id).to_string())
}

// GET /nodes
async fn list_nodes(State(app): State<AppState>) -> Json<Vec<Node>> {
    Json(app.control.store().nodes())
}

// GET /nodes/{id}
async fn get_node(State(app): State<AppState>, Path(id): Path<NodeId>) -> Result<Json<NodeView>, ApiError> {
    let store = app.control.store();
    let node = store.node(id).ok_or_else(|| node_not_found(id))?;
    Ok(Json(NodeView {
        node,
        allocations: store.allocations(id),
    }))
}

// GET /nodes/{id}/status
async fn get_node_status(
    State(app): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<NodeStatusView>, ApiError> {
    let node = app.control.store().node(id).ok_or_else(|| node_not_found(id))?;
    Ok(Json(NodeStatusView {
        status: node.status,
        used_ram: node.used_ram,
        total_ram: node.total_ram,
        used_cpu: node.used_cpu,
        total_cpu: node.total_cpu,
    }))
}

#[derive(Debug, Serialize)]
struct ServerLocation {
    server_id: ServerId,
    node_id: NodeId,
}

// GET /internal/servers/{id}
async fn locate_server(
    State(app): State<AppState>,
    Path(id): Path<ServerId>,
) -> Result<Json<ServerLocation>, ControlError> {
    let server = app.control.store().server(id).ok_or(ControlError::NotFound(id))?;
    Ok(Json(ServerLocation {
        server_id: server.id,
        node_id: server.node_id,
    }))
}
