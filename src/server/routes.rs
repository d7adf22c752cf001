//! HTTP and WebSocket endpoints
//!
//! - `GET /ws/rooms/:room_key?name=` joins a room over a WebSocket
//! - `GET /health` reports liveness and the number of open rooms

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Extension, Path, Query};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use blockgraph_collab::{EmptySnapshot, Hub};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Query string accepted on the join endpoint
#[derive(Debug, Default, Deserialize)]
pub struct JoinParams {
    #[serde(default)]
    pub name: Option<String>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub rooms: usize,
}

/// Build the collaboration router. The hub is provided via `Extension`.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/rooms/:room_key", get(join_room))
}

async fn health(Extension(hub): Extension<Arc<Hub>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        rooms: hub.room_count().await,
    })
}

async fn join_room(
    ws: WebSocketUpgrade,
    Path(room_key): Path<String>,
    Query(params): Query<JoinParams>,
    Extension(hub): Extension<Arc<Hub>>,
) -> impl IntoResponse {
    let name = params.name.unwrap_or_default();
    ws.on_upgrade(move |socket| async move {
        match hub
            .connect_or_load(&room_key, &EmptySnapshot, socket, name)
            .await
        {
            Ok(user) => debug!(room_key = %room_key, user_id = %user.id, "WebSocket joined room"),
            Err(e) => warn!(room_key = %room_key, error = %e, "Failed to join room"),
        }
    })
}
