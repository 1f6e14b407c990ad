//! Customer lifecycle endpoints (business-scoped).

use crate::actors::business::CreateKeyRequest;
use crate::error::ApiError;
use crate::models::{Customer, KeyType, Principal};
use crate::registry::RegistryKey;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

fn business_principal(principal: &Principal) -> Result<String, ApiError> {
    match principal {
        Principal::Business { business_id } => Ok(business_id.clone()),
        _ => Err(ApiError::unauthorized(
            "customer management requires a business key",
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateCustomerRequest {
    pub customer_id: String,
    pub customer_name: String,
    pub email: Option<String>,
    pub plan_id: Option<String>,
    pub stripe_customer_id: Option<String>,
}

pub async fn create_customer(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<CreateCustomerRequest>,
) -> Result<Json<Customer>, ApiError> {
    let business_id = business_principal(&principal)?;
    if request.customer_id.trim().is_empty() {
        return Err(ApiError::validation("customer_id must not be empty"));
    }
    if request.customer_id.contains('/') || request.customer_id.contains('|') {
        return Err(ApiError::validation(
            "customer_id must not contain '/' or '|'",
        ));
    }

    if let Some(plan_id) = &request.plan_id {
        let plan = state
            .row_store
            .get_plan(plan_id)
            .await
            .map_err(ApiError::Internal)?
            .filter(|p| p.business_id == business_id);
        if plan.is_none() {
            return Err(ApiError::not_found(format!("plan {plan_id}")));
        }
    }

    if state
        .row_store
        .get_customer(&business_id, &request.customer_id)
        .await
        .map_err(ApiError::Internal)?
        .is_some()
    {
        return Err(ApiError::conflict(format!(
            "customer {} already exists",
            request.customer_id
        )));
    }

    let customer = Customer {
        business_id: business_id.clone(),
        customer_id: request.customer_id,
        customer_name: request.customer_name,
        email: request.email,
        plan_id: request.plan_id,
        stripe_price_id: None,
        stripe_customer_id: request.stripe_customer_id,
        stripe_subscription_id: None,
        subscription_ends_at: None,
        user_id: None,
        created_at: Utc::now(),
        deleted_at: None,
    };
    state
        .row_store
        .insert_customer(&customer)
        .await
        .map_err(ApiError::Internal)?;
    info!(
        business_id = %business_id,
        customer_id = %customer.customer_id,
        "customer created"
    );
    Ok(Json(customer))
}

pub async fn get_customer(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(customer_id): Path<String>,
) -> Result<Json<Customer>, ApiError> {
    let business_id = business_principal(&principal)?;
    let customer = state
        .row_store
        .get_customer(&business_id, &customer_id)
        .await
        .map_err(ApiError::Internal)?
        .filter(|c| c.deleted_at.is_none())
        .ok_or_else(|| ApiError::not_found(format!("customer {customer_id}")))?;
    Ok(Json(customer))
}

pub async fn delete_customer(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(customer_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let business_id = business_principal(&principal)?;
    state
        .row_store
        .get_customer(&business_id, &customer_id)
        .await
        .map_err(ApiError::Internal)?
        .filter(|c| c.deleted_at.is_none())
        .ok_or_else(|| ApiError::not_found(format!("customer {customer_id}")))?;

    state
        .row_store
        .soft_delete_customer(&business_id, &customer_id, Utc::now())
        .await
        .map_err(ApiError::Internal)?;

    if let Some(handle) = state
        .registry
        .lookup(&RegistryKey::Customer {
            business_id: business_id.clone(),
            customer_id: customer_id.clone(),
        })
        .and_then(|r| r.as_customer())
    {
        let _ = handle.shutdown().await;
    }

    info!(business_id = %business_id, customer_id = %customer_id, "customer soft-deleted");
    Ok(Json(serde_json::json!({
        "customer_id": customer_id,
        "deleted": true,
        "grace_days": 30,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateCustomerKeyRequest {
    pub key_name: String,
}

pub async fn create_customer_key(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(customer_id): Path<String>,
    Json(request): Json<CreateCustomerKeyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let business_id = business_principal(&principal)?;
    state
        .row_store
        .get_customer(&business_id, &customer_id)
        .await
        .map_err(ApiError::Internal)?
        .filter(|c| c.deleted_at.is_none())
        .ok_or_else(|| ApiError::not_found(format!("customer {customer_id}")))?;

    let app = state
        .application()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("application actor not started")))?;
    let issued = app
        .ensure_business(&business_id)
        .await
        .map_err(ApiError::from)?
        .create_key(CreateKeyRequest {
            key_type: KeyType::CustomerApi,
            key_name: request.key_name,
            customer_id: Some(customer_id),
            credential: None,
            metadata: None,
        })
        .await
        .map_err(ApiError::from)?;

    Ok(Json(serde_json::json!({
        "api_key": issued.plaintext,
        "key_name": issued.key.key_name,
        "warning": "Store this key now; the plaintext is never shown again.",
    })))
}
