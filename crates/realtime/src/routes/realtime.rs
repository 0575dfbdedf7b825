//! Realtime delivery introspection and announcements

use axum::{extract::State, Extension, Json};
use helpdesk_shared::UserId;
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RealtimeStats {
    pub online_users: usize,
    pub client_count: usize,
}

/// Connection counts for the whole process
pub async fn stats(State(state): State<AppState>) -> Json<RealtimeStats> {
    let stats = state.hub.stats();
    Json(RealtimeStats {
        online_users: stats.online_users,
        client_count: stats.client_count,
    })
}

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub users: Vec<UserId>,
}

/// Users with at least one live connection (admin only)
pub async fn online_users(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<OnlineUsersResponse>> {
    if !user.is_admin() {
        return Err(ApiError::Forbidden);
    }

    Ok(Json(OnlineUsersResponse {
        users: state.push.online_users(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SystemNotificationRequest {
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SystemNotificationResponse {
    pub delivered: usize,
}

/// Broadcast an announcement to every connected user (admin only)
pub async fn send_system_notification(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<SystemNotificationRequest>,
) -> ApiResult<Json<SystemNotificationResponse>> {
    if !user.is_admin() {
        return Err(ApiError::Forbidden);
    }

    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }

    tracing::info!(user_id = %user.user_id, title = %title, "System notification requested");
    let delivered = state.push.push_system_notification(title, &req.content);

    Ok(Json(SystemNotificationResponse { delivered }))
}
