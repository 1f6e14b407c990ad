//! Plan and plan-limit endpoints.

use crate::error::ApiError;
use crate::models::{
    BreachAction, BreachOperator, MetricType, Plan, PlanLimit, Principal,
};
use crate::registry::RegistryKey;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

fn business_principal(principal: &Principal) -> Result<String, ApiError> {
    match principal {
        Principal::Business { business_id } => Ok(business_id.clone()),
        _ => Err(ApiError::unauthorized(
            "plan management requires a business key",
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub plan_name: String,
    pub stripe_price_id: Option<String>,
}

pub async fn create_plan(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<CreatePlanRequest>,
) -> Result<Json<Plan>, ApiError> {
    let business_id = business_principal(&principal)?;
    if request.plan_name.trim().is_empty() {
        return Err(ApiError::validation("plan_name must not be empty"));
    }

    let plan = Plan {
        id: format!("plan_{}", &Uuid::new_v4().simple().to_string()[..12]),
        business_id: business_id.clone(),
        plan_name: request.plan_name,
        stripe_price_id: request.stripe_price_id,
        plan_status: "active".into(),
    };
    state
        .row_store
        .insert_plan(&plan)
        .await
        .map_err(|e| ApiError::conflict(format!("plan insert failed: {e:#}")))?;
    info!(business_id = %business_id, plan_id = %plan.id, "plan created");
    Ok(Json(plan))
}

#[derive(Debug, Deserialize)]
pub struct CreatePlanLimitRequest {
    pub metric_name: String,
    pub limit_value: f64,
    pub limit_period: Option<String>,
    pub breach_operator: String,
    pub breach_action: String,
    pub webhook_urls: Option<Vec<String>>,
    pub metric_type: Option<String>,
    /// Attach to a plan, a single customer, or (neither) the business
    /// defaults.
    pub plan_id: Option<String>,
    pub customer_id: Option<String>,
}

pub async fn create_plan_limit(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<CreatePlanLimitRequest>,
) -> Result<Json<PlanLimit>, ApiError> {
    let business_id = business_principal(&principal)?;
    if request.plan_id.is_some() && request.customer_id.is_some() {
        return Err(ApiError::validation(
            "a limit applies to exactly one scope; pass plan_id or customer_id, not both",
        ));
    }
    let breach_operator = BreachOperator::from_str(&request.breach_operator).ok_or_else(|| {
        ApiError::validation(format!("unknown breach_operator: {}", request.breach_operator))
    })?;
    let breach_action = BreachAction::from_str(&request.breach_action).ok_or_else(|| {
        ApiError::validation(format!("unknown breach_action: {}", request.breach_action))
    })?;
    let metric_type = match &request.metric_type {
        Some(t) => MetricType::from_str(t)
            .ok_or_else(|| ApiError::validation(format!("unknown metric_type: {t}")))?,
        None => MetricType::Reset,
    };
    if let Some(period) = &request.limit_period {
        if !state.tick_bus.is_supported(period) {
            return Err(ApiError::validation(format!(
                "unsupported limit_period: {period}"
            )));
        }
    }
    if breach_action == BreachAction::Webhook
        && request.webhook_urls.as_ref().map(|u| u.is_empty()).unwrap_or(true)
    {
        return Err(ApiError::validation(
            "webhook breach_action requires webhook_urls",
        ));
    }

    if let Some(plan_id) = &request.plan_id {
        state
            .row_store
            .get_plan(plan_id)
            .await
            .map_err(ApiError::Internal)?
            .filter(|p| p.business_id == business_id)
            .ok_or_else(|| ApiError::not_found(format!("plan {plan_id}")))?;
    }

    let limit = PlanLimit {
        id: format!("pl_{}", &Uuid::new_v4().simple().to_string()[..12]),
        business_id: business_id.clone(),
        plan_id: request.plan_id,
        customer_id: request.customer_id.clone(),
        metric_name: request.metric_name,
        limit_value: request.limit_value,
        limit_period: request.limit_period,
        breach_operator,
        breach_action,
        webhook_urls: request.webhook_urls,
        metric_type,
    };
    state
        .row_store
        .insert_plan_limit(&limit)
        .await
        .map_err(ApiError::Internal)?;
    info!(
        business_id = %business_id,
        metric = %limit.metric_name,
        scope = ?limit.scope(),
        "plan limit created"
    );

    // Push the change into live customer actors so enforcement picks it
    // up without a restart.
    let customers = match &request.customer_id {
        Some(customer_id) => vec![RegistryKey::Customer {
            business_id: business_id.clone(),
            customer_id: customer_id.clone(),
        }],
        None => state.registry.keys_where(|k| {
            matches!(k, RegistryKey::Customer { business_id: b, .. } if *b == business_id)
        }),
    };
    for key in customers {
        if let Some(handle) = state.registry.lookup(&key).and_then(|r| r.as_customer()) {
            let _ = handle.refresh_plan().await;
        }
    }

    Ok(Json(limit))
}

#[derive(Debug, Deserialize)]
pub struct ListPlanLimitsQuery {
    pub plan_id: Option<String>,
    pub customer_id: Option<String>,
}

pub async fn list_plan_limits(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListPlanLimitsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let business_id = business_principal(&principal)?;
    let limits = state
        .row_store
        .list_plan_limits(
            &business_id,
            query.plan_id.as_deref(),
            query.customer_id.as_deref(),
        )
        .await
        .map_err(ApiError::Internal)?;
    let count = limits.len();
    Ok(Json(serde_json::json!({
        "plan_limits": limits,
        "count": count,
    })))
}
