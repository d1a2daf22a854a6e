#![forbid(unsafe_code)]

// Signaling module - WebSocket endpoint and operational surfaces.

pub mod connection;
pub mod protocol;

use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Largest accepted WebSocket text frame; signaling payloads are small.
const MAX_FRAME_SIZE: usize = 65_536;

/// Signaling server state.
#[derive(Clone)]
pub struct SignalingServer {
    rooms: Arc<RoomManager>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    pub fn new(rooms: Arc<RoomManager>, metrics: ServerMetrics) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("Max connections: {}", max_connections);

        Self {
            rooms,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Builds the axum app: the single signaling path plus health/metrics.
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds and serves until the listener fails.
    ///
    /// # Errors
    /// Returns an error if binding or serving fails.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Signaling server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.rooms.room_count(),
        "peers": server.rooms.peer_count(),
    }))
}

async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let body = server
        .metrics
        .render_prometheus(server.rooms.room_count(), server.rooms.peer_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_FRAME_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.rooms, server.metrics, permit)
        })
}
