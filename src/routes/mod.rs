//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the health check and the chat websocket endpoint
//! under a single Axum router. Everything else the service does happens
//! inside established websocket sessions.

pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
#[must_use]
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/chat/{chat_id}", get(ws::handle_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
