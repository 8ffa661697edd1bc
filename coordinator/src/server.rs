//! HTTP and WebSocket surface.
//!
//! Workers connect to `/ws`; the `/api` routes serve health, statistics,
//! Prometheus metrics and token minting.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use banklock_common::WorkerId;
use banklock_protocol::encode;

use crate::connection::{ConnectionId, OutboundReceiver};
use crate::coordinator::Coordinator;

/// Shared router state.
pub type AppState = Arc<Coordinator>;

/// `GET /api/health` body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub servicio: String,
    pub puerto: u16,
    pub timestamp: i64,
}

/// `GET /api/generate-token/{workerId}` body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub worker_id: WorkerId,
    pub token: String,
    pub expires_at: i64,
}

/// Permissive CORS for the admin surface.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the application router.
pub fn router(coordinator: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/metrics", get(metrics))
        .route("/api/generate-token/{worker_id}", get(generate_token))
        .fallback(not_found)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// Serve until SIGINT, then stop the coordinator and close every socket.
pub async fn serve(coordinator: AppState, listener: TcpListener) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Coordinator listening");

    axum::serve(listener, router(coordinator.clone()))
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await
}

async fn shutdown_signal(coordinator: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
    if let Err(e) = coordinator.stop().await {
        error!(error = %e, "Error during shutdown");
    }
}

async fn health(State(coordinator): State<AppState>) -> Json<HealthResponse> {
    let config = coordinator.config();
    Json(HealthResponse {
        status: "OK",
        servicio: config.service_name.clone(),
        puerto: config.listen_port,
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
}

async fn stats(State(coordinator): State<AppState>) -> impl IntoResponse {
    Json(coordinator.stats())
}

async fn metrics(State(coordinator): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        coordinator.prometheus(),
    )
}

async fn generate_token(
    State(coordinator): State<AppState>,
    Path(worker_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(admin_key) = &coordinator.config().auth_config.admin_key {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(admin_key.as_str()) {
            warn!(worker_id = %worker_id, "Token request without valid admin key");
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
        }
    }

    let worker_id = WorkerId::new(worker_id);
    if !worker_id.is_valid() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid workerId" }))).into_response();
    }

    let issued = coordinator.issue_token(&worker_id);
    Json(TokenResponse {
        worker_id: issued.worker_id,
        token: issued.token,
        expires_at: issued.expires_at.timestamp_millis(),
    })
    .into_response()
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

async fn ws_handler(ws: WebSocketUpgrade, State(coordinator): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, coordinator))
}

/// Drive one worker socket until either side closes it.
async fn handle_socket(socket: WebSocket, coordinator: AppState) {
    let (connection, outbound) = coordinator.open_connection();
    info!(connection_id = %connection, "Worker connection opened");

    let (sender, mut receiver) = socket.split();
    let mut send_task = tokio::spawn(write_outbound(sender, outbound, connection));

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => coordinator.handle_frame(connection, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %connection, error = %e, "Socket error");
                    break;
                }
            },
        }
    }

    send_task.abort();
    coordinator.handle_disconnect(connection);
    info!(connection_id = %connection, "Worker connection closed");
}

/// Drain the outbound channel into the socket; a closed channel closes the socket.
async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: OutboundReceiver,
    connection: ConnectionId,
) {
    while let Some(message) = outbound.recv().await {
        let text = match encode(&message) {
            Ok(text) => text,
            Err(e) => {
                error!(connection_id = %connection, error = %e, "Failed to encode message");
                continue;
            }
        };
        if let Err(e) = sender.send(Message::Text(text.into())).await {
            debug!(connection_id = %connection, error = %e, "Send failed");
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}
