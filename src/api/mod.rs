//! HTTP API surface.
//!
//! Three auth tiers: admin endpoints behind `X-Admin-Key`, tenant
//! endpoints behind bearer keys resolved through the auth cache, and the
//! unauthenticated webhook ingress (verified by signature instead).

pub mod admin;
pub mod businesses;
pub mod customers;
pub mod keys;
pub mod metrics;
pub mod plans;
pub mod proxy;
pub mod webhooks;

use crate::auth::{
    admin_auth_middleware, admin_or_bearer_middleware, auth_middleware, AuthState,
};
use crate::error::ApiError;
use crate::models::{AccountId, Principal};
use crate::state::AppState;
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn router(state: Arc<AppState>) -> Router {
    let auth = AuthState {
        state: state.clone(),
    };

    let admin_routes = Router::new()
        .route("/api/v1/businesses", post(businesses::create_business))
        .route(
            "/api/v1/businesses/:business_id",
            get(businesses::get_business).delete(businesses::delete_business),
        )
        .route(
            "/api/v1/admin/billing_events",
            get(admin::list_billing_events),
        )
        .route_layer(middleware::from_fn_with_state(
            auth.clone(),
            admin_auth_middleware,
        ));

    let key_routes = Router::new()
        .route("/api/v1/keys", post(keys::create_key).get(keys::list_keys))
        .route_layer(middleware::from_fn_with_state(
            auth.clone(),
            admin_or_bearer_middleware,
        ));

    let tenant_routes = Router::new()
        .route("/api/v1/keys/:key_name", delete(keys::deactivate_key))
        .route("/api/v1/customers", post(customers::create_customer))
        .route(
            "/api/v1/customers/:customer_id",
            get(customers::get_customer).delete(customers::delete_customer),
        )
        .route(
            "/api/v1/customers/:customer_id/keys",
            post(customers::create_customer_key),
        )
        .route("/api/v1/plans", post(plans::create_plan))
        .route(
            "/api/v1/plan_limits",
            post(plans::create_plan_limit).get(plans::list_plan_limits),
        )
        .route("/api/v1/metrics", post(metrics::create_metric))
        .route(
            "/api/v1/metrics/:metric_name",
            put(metrics::increment_metric).get(metrics::get_metric),
        )
        .route("/api/v1/proxy", post(proxy::proxy_request))
        .route_layer(middleware::from_fn_with_state(auth, auth_middleware));

    let open_routes = Router::new()
        .route("/api/v1/webhooks/stripe", post(webhooks::stripe_webhook))
        .route(
            "/api/v1/webhooks/stripe/:business_id",
            post(webhooks::stripe_webhook_for_business),
        )
        .route("/health", get(health));

    Router::new()
        .merge(admin_routes)
        .merge(key_routes)
        .merge(tenant_routes)
        .merge(open_routes)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Resolve the account a metric request targets from the principal and
/// the `scope`/`customer_id` query parameters.
pub(crate) fn resolve_account(
    principal: &Principal,
    scope: Option<&str>,
    customer_id: Option<&str>,
) -> Result<AccountId, ApiError> {
    match principal {
        Principal::Admin => Err(ApiError::unauthorized(
            "metric endpoints require a business or customer key",
        )),
        Principal::Business { business_id } => match scope.unwrap_or("business") {
            "business" => Ok(AccountId::business(business_id.clone())),
            "customer" => {
                let customer_id = customer_id
                    .ok_or_else(|| ApiError::validation("customer scope requires customer_id"))?;
                Ok(AccountId::customer(business_id.clone(), customer_id))
            }
            other => Err(ApiError::validation(format!("unknown scope: {other}"))),
        },
        Principal::Customer {
            business_id,
            customer_id: own,
        } => match scope.unwrap_or("customer") {
            "customer" => {
                if let Some(requested) = customer_id {
                    if requested != own {
                        return Err(ApiError::unauthorized(
                            "customer keys cannot act on other customers",
                        ));
                    }
                }
                Ok(AccountId::customer(business_id.clone(), own.clone()))
            }
            _ => Err(ApiError::unauthorized(
                "customer keys are limited to customer scope",
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_account_for_business_principal() {
        let principal = Principal::Business {
            business_id: "biz_1".into(),
        };
        assert_eq!(
            resolve_account(&principal, Some("business"), None).unwrap(),
            AccountId::business("biz_1")
        );
        assert_eq!(
            resolve_account(&principal, Some("customer"), Some("cust_1")).unwrap(),
            AccountId::customer("biz_1", "cust_1")
        );
        assert!(resolve_account(&principal, Some("customer"), None).is_err());
        assert!(resolve_account(&principal, Some("galaxy"), None).is_err());
    }

    #[test]
    fn test_resolve_account_for_customer_principal() {
        let principal = Principal::Customer {
            business_id: "biz_1".into(),
            customer_id: "cust_1".into(),
        };
        assert_eq!(
            resolve_account(&principal, None, None).unwrap(),
            AccountId::customer("biz_1", "cust_1")
        );
        // A customer key cannot reach a sibling's metrics.
        assert!(resolve_account(&principal, Some("customer"), Some("cust_2")).is_err());
        assert!(resolve_account(&principal, Some("business"), None).is_err());
    }
}
