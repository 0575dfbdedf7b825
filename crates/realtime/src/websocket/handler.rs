//! WebSocket handler for Axum
//!
//! Upgrades authenticated requests and hands the socket to the pumps.

use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    response::Response,
    Extension,
};
use futures::StreamExt;
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

use super::connection;
use super::pump::run_connection;

/// WebSocket handler - upgrades HTTP connection to WebSocket
///
/// Identity comes from `require_auth`; without it the upgrade is refused.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
) -> ApiResult<Response> {
    let Some(Extension(user)) = user else {
        tracing::warn!("WebSocket upgrade without authenticated user");
        return Err(ApiError::Unauthorized);
    };

    tracing::info!(user_id = %user.user_id, "WebSocket connection upgrade requested");

    Ok(ws
        .max_message_size(state.config.ws_max_message_bytes)
        .on_upgrade(move |socket| serve_socket(socket, user, state)))
}

/// Handle individual WebSocket connection
async fn serve_socket(socket: WebSocket, user: AuthUser, state: AppState) {
    let (writer, reader) = socket.split();

    let (conn, outbox) =
        connection::open(user.user_id, state.config.ws_outbound_queue_capacity);
    if !state.hub.register(&conn) {
        return;
    }

    if state.config.ws_welcome_enabled {
        state.push.send_welcome_message(user.user_id);
    }

    run_connection(
        writer,
        reader,
        conn,
        outbox,
        Arc::clone(&state.hub),
        Arc::clone(&state.read_receipts),
        state.pump_settings(),
    )
    .await;
}
