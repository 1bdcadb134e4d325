//! HTTP/NDJSON + MCP JSON-RPC surface over [`sandbox_core`]. Exposed as a
//! library so integration tests can build a [`Router`] against an in-process
//! [`SessionManager`] without going through the `main` binary.

pub mod auth;
pub mod error;
pub mod mcp;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::middleware;
use axum::routing::get;
use axum::routing::post;
use axum::Router;
use sandbox_core::Config;
use sandbox_core::SessionManager;

use crate::state::AppState;

const API_PREFIX: &str = "/ai/sandbox/v1/api";

pub fn build_router(manager: Arc<SessionManager>, config: Arc<Config>) -> Router {
    let state = AppState { manager, config };

    let api = Router::new()
        .route("/execute", post(routes::execute_stream))
        .route("/execute_sync", post(routes::execute_sync))
        .route("/sessions", post(routes::create_session).get(routes::list_sessions))
        .route(
            "/sessions/{id}",
            get(routes::get_session).delete(routes::delete_session),
        )
        .route("/sessions/{id}/interrupt", post(routes::interrupt_session));

    Router::new()
        .route("/health", get(routes::health))
        .route("/mcp", post(mcp::handle))
        .nest(API_PREFIX, api)
        .fallback(routes::not_found)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer))
        .with_state(state)
}
