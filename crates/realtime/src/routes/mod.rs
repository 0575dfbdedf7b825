//! HTTP routes

pub mod health;
pub mod realtime;

use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{auth::require_auth, state::AppState, websocket::ws_handler};

/// Create all routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Protected API routes - under /api/v1
    let protected_api_routes = Router::new()
        .route("/realtime/stats", get(realtime::stats))
        .route("/realtime/online-users", get(realtime::online_users))
        .route(
            "/realtime/system-notifications",
            post(realtime::send_system_notification),
        )
        .layer(middleware::from_fn_with_state(auth_state.clone(), require_auth));

    // WebSocket upgrade; the token may come from the query string
    let websocket_routes = Router::new()
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .merge(health_routes)
        .merge(websocket_routes)
        .nest("/api/v1", protected_api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
