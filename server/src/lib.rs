//! Meshtalk Rendezvous Server
//!
//! Tracks room membership and relays signaling envelopes between peers.
//! Stateless across restarts; recovery is driven by clients rejoining.

pub mod config;
pub mod rendezvous;
pub mod ws;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

/// Build the application router.
#[must_use]
pub fn create_router(state: ws::AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
