//! Authentication middleware.
//!
//! Tenant and customer requests carry `Authorization: Bearer <api_key>`;
//! the key is hashed and resolved through the application actor's auth
//! cache. Admin endpoints use `X-Admin-Key` compared hash-to-hash against
//! the configured admin secret.

use crate::auth::keys::hash_key;
use crate::error::ApiError;
use crate::models::Principal;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AuthState {
    pub state: Arc<AppState>,
}

fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string())
}

/// Resolve the bearer key to a principal and stash it in extensions.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token =
        bearer_token(&req).ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    let key_hash = hash_key(&token);

    let app = auth
        .state
        .application()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("application actor not started")))?;
    let principal = app
        .authenticate(&key_hash)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::unauthorized("invalid or inactive api key"))?;

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// Admin gate. Hash-to-hash comparison keeps the check constant-time in
/// the secret's contents.
pub async fn admin_auth_middleware(
    State(auth): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = req
        .headers()
        .get("X-Admin-Key")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing admin key"))?;

    if hash_key(provided) != hash_key(&auth.state.config.admin_secret) {
        return Err(ApiError::unauthorized("invalid admin key"));
    }

    req.extensions_mut().insert(Principal::Admin);
    Ok(next.run(req).await)
}

/// Accepts either an admin key or a bearer key. Used by the key-issuing
/// endpoint, which serves both platform admins and businesses.
pub async fn admin_or_bearer_middleware(
    State(auth): State<AuthState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if req.headers().contains_key("X-Admin-Key") {
        admin_auth_middleware(State(auth), req, next).await
    } else {
        auth_middleware(State(auth), req, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    #[test]
    fn test_bearer_token_extraction() {
        let req = HttpRequest::builder()
            .header("Authorization", "Bearer tk_abc123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&req).as_deref(), Some("tk_abc123"));

        let req = HttpRequest::builder()
            .header("Authorization", "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        assert!(bearer_token(&req).is_none());

        let req = HttpRequest::new(Body::empty());
        assert!(bearer_token(&req).is_none());
    }
}
