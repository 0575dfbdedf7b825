//! Authentication middleware
//!
//! Attaches an [`AuthUser`] to the request after validating the access token.
//! Browsers cannot set headers on a WebSocket upgrade, so the token may also
//! arrive as a `?token=` query parameter.

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use helpdesk_shared::UserId;
use serde::Deserialize;

use super::jwt::{JwtError, JwtVerifier};
use crate::error::ApiError;

/// State needed by the auth middleware
#[derive(Debug, Clone)]
pub struct AuthState {
    pub jwt: Arc<JwtVerifier>,
}

/// Identity of an authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: UserId,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn extract_token(request: &Request) -> Option<String> {
    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());

    bearer.or_else(|| {
        Query::<TokenQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(query)| query.token)
    })
}

/// Reject requests without a valid access token
pub async fn require_auth(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(&request).ok_or(ApiError::Unauthorized)?;

    let claims = auth.jwt.validate_token(&token).map_err(|e| {
        tracing::debug!(error = %e, path = %request.uri().path(), "Rejected access token");
        match e {
            JwtError::Expired | JwtError::Invalid | JwtError::Validation(_) => {
                ApiError::InvalidToken
            }
            JwtError::Encoding(_) => ApiError::Internal,
        }
    })?;

    if claims.sub.is_unset() {
        return Err(ApiError::InvalidToken);
    }

    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        role: claims.role,
    });

    Ok(next.run(request).await)
}
