//! Admin endpoints for tenant lifecycle.

use crate::error::ApiError;
use crate::models::{Business, Plan};
use crate::registry::RegistryKey;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateBusinessRequest {
    pub business_id: Option<String>,
    pub business_name: String,
    pub email: String,
}

pub async fn create_business(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateBusinessRequest>,
) -> Result<Json<Business>, ApiError> {
    if request.business_name.trim().is_empty() {
        return Err(ApiError::validation("business_name must not be empty"));
    }
    let business_id = request
        .business_id
        .unwrap_or_else(|| format!("biz_{}", &Uuid::new_v4().simple().to_string()[..12]));

    if state
        .row_store
        .get_business(&business_id)
        .await
        .map_err(ApiError::Internal)?
        .is_some()
    {
        return Err(ApiError::conflict(format!(
            "business {business_id} already exists"
        )));
    }

    let business = Business {
        business_id: business_id.clone(),
        business_name: request.business_name,
        email: request.email,
        stripe_customer_id: None,
        subscription_status: None,
        plan_type: None,
        created_at: Utc::now(),
        deleted_at: None,
    };
    state
        .row_store
        .insert_business(&business)
        .await
        .map_err(ApiError::Internal)?;

    // Every business carries the distinguished downgrade target.
    let free_plan = Plan {
        id: format!("plan_{}", &Uuid::new_v4().simple().to_string()[..12]),
        business_id: business_id.clone(),
        plan_name: "free_plan".into(),
        stripe_price_id: None,
        plan_status: "active".into(),
    };
    state
        .row_store
        .insert_plan(&free_plan)
        .await
        .map_err(ApiError::Internal)?;

    state
        .row_store
        .insert_audit_log("admin", "business.created", &business_id, None)
        .await
        .map_err(ApiError::Internal)?;
    info!(business_id = %business_id, "business created");
    Ok(Json(business))
}

pub async fn get_business(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
) -> Result<Json<Business>, ApiError> {
    let business = state
        .row_store
        .get_business(&business_id)
        .await
        .map_err(ApiError::Internal)?
        .filter(|b| b.deleted_at.is_none())
        .ok_or_else(|| ApiError::not_found(format!("business {business_id}")))?;
    Ok(Json(business))
}

pub async fn delete_business(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .row_store
        .get_business(&business_id)
        .await
        .map_err(ApiError::Internal)?
        .filter(|b| b.deleted_at.is_none())
        .ok_or_else(|| ApiError::not_found(format!("business {business_id}")))?;

    state
        .row_store
        .soft_delete_business(&business_id, Utc::now())
        .await
        .map_err(ApiError::Internal)?;

    // Stop the live actor tree; the sweeper reaps the rows after grace.
    if let Some(handle) = state
        .registry
        .lookup(&RegistryKey::Business(business_id.clone()))
        .and_then(|r| r.as_business())
    {
        let _ = handle.shutdown().await;
    }

    state
        .row_store
        .insert_audit_log("admin", "business.deleted", &business_id, None)
        .await
        .map_err(ApiError::Internal)?;
    info!(business_id = %business_id, "business soft-deleted");
    Ok(Json(serde_json::json!({
        "business_id": business_id,
        "deleted": true,
        "grace_days": 30,
    })))
}
