pub mod cli;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod ws;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, room_status};
use crate::ws::{websocket_handler, RelayState};

/// Assemble the relay's router: the websocket signaling endpoint plus the
/// read-only HTTP status surface.
pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/rooms/:room_id", get(room_status))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
