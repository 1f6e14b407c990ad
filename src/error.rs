//! Error kinds surfaced by the HTTP layer.
//!
//! Actors and workers propagate `anyhow::Result` internally; handlers
//! translate into `ApiError` at the boundary so clients see stable
//! status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;
use uuid::Uuid;

#[derive(Debug)]
pub enum ApiError {
    /// Entity absent.
    NotFound(String),
    /// Auth failure.
    Unauthorized(String),
    /// Bad input.
    Validation(String),
    /// Uniqueness or state transition violation.
    Conflict(String),
    /// Billing / webhook / row-store failure surfaced synchronously.
    Upstream { message: String, timeout: bool },
    /// Plan enforcement. 402 for billing-backed denials, 429 otherwise.
    Breached { message: String, billable: bool },
    /// Invariant broken; logged with a correlation id.
    Internal(anyhow::Error),
    /// Pro-tier knobs that are recognized but not supported.
    NotImplemented(String),
}

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ApiError::NotFound(what.into())
    }

    pub fn unauthorized(why: impl Into<String>) -> Self {
        ApiError::Unauthorized(why.into())
    }

    pub fn validation(why: impl Into<String>) -> Self {
        ApiError::Validation(why.into())
    }

    pub fn conflict(why: impl Into<String>) -> Self {
        ApiError::Conflict(why.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        ApiError::Upstream {
            message: message.into(),
            timeout: false,
        }
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        ApiError::Upstream {
            message: message.into(),
            timeout: true,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", what),
            ApiError::Unauthorized(why) => (StatusCode::UNAUTHORIZED, "unauthorized", why),
            ApiError::Validation(why) => (StatusCode::BAD_REQUEST, "validation_error", why),
            ApiError::Conflict(why) => (StatusCode::CONFLICT, "conflict", why),
            ApiError::Upstream { message, timeout } => {
                let status = if timeout {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, "upstream_failed", message)
            }
            ApiError::Breached { message, billable } => {
                let status = if billable {
                    StatusCode::PAYMENT_REQUIRED
                } else {
                    StatusCode::TOO_MANY_REQUESTS
                };
                (status, "limit_breached", message)
            }
            ApiError::Internal(err) => {
                let correlation_id = Uuid::new_v4();
                error!(%correlation_id, error = ?err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    format!("internal error (correlation id {correlation_id})"),
                )
            }
            ApiError::NotImplemented(what) => {
                (StatusCode::NOT_IMPLEMENTED, "not_implemented", what)
            }
        };

        let body = serde_json::json!({
            "error": code,
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::not_found("metric").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::unauthorized("bad key").into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::validation("bad body").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::conflict("duplicate").into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::upstream("stripe 500").into_response().status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::upstream_timeout("stripe timeout")
                .into_response()
                .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::NotImplemented("precision mode".into())
                .into_response()
                .status(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_breached_status_depends_on_billability() {
        let billable = ApiError::Breached {
            message: "over limit".into(),
            billable: true,
        };
        assert_eq!(billable.into_response().status(), StatusCode::PAYMENT_REQUIRED);

        let hard = ApiError::Breached {
            message: "over limit".into(),
            billable: false,
        };
        assert_eq!(hard.into_response().status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
