//! Metric definition and ingestion endpoints.

use crate::actors::metric::MetricHandle;
use crate::api::resolve_account;
use crate::error::ApiError;
use crate::models::{
    AccountId, BreachAction, BreachOperator, MetricAdapters, MetricDefinition, MetricMode,
    MetricOp, MetricType, Principal,
};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ScopeQuery {
    pub scope: Option<String>,
    pub customer_id: Option<String>,
}

/// Route to the owning actor: business-scope metrics live on the business
/// actor, customer-scope metrics on the customer actor.
pub(crate) async fn touch_metric(
    state: &Arc<AppState>,
    account: &AccountId,
    metric_name: &str,
    definition: Option<MetricDefinition>,
) -> Result<MetricHandle, ApiError> {
    let app = state
        .application()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("application actor not started")))?;
    let business = app
        .ensure_business(&account.business_id)
        .await
        .map_err(ApiError::from)?;
    match &account.customer_id {
        Some(customer_id) => {
            let customer = business
                .ensure_customer(customer_id)
                .await
                .map_err(ApiError::from)?;
            customer
                .touch(metric_name, definition)
                .await
                .map_err(ApiError::from)
        }
        None => business
            .touch_metric(metric_name, definition)
            .await
            .map_err(ApiError::from),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateMetricRequest {
    pub metric_name: String,
    #[serde(default)]
    pub mode: MetricMode,
    pub operation: Option<String>,
    pub metric_type: Option<String>,
    pub flush_interval: Option<String>,
    pub initial_value: Option<f64>,
    pub limit_value: Option<f64>,
    pub limit_operator: Option<String>,
    pub breach_action: Option<String>,
    pub webhook_urls: Option<Vec<String>>,
    #[serde(default)]
    pub adapters: MetricAdapters,
}

pub async fn create_metric(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ScopeQuery>,
    Json(request): Json<CreateMetricRequest>,
) -> Result<Json<MetricDefinition>, ApiError> {
    let account = resolve_account(&principal, query.scope.as_deref(), query.customer_id.as_deref())?;

    if request.metric_name.trim().is_empty() {
        return Err(ApiError::validation("metric_name must not be empty"));
    }
    if request.metric_name.contains('|') || request.metric_name.contains('/') {
        return Err(ApiError::validation(
            "metric_name must not contain '|' or '/'",
        ));
    }
    if request.mode == MetricMode::Precision {
        return Err(ApiError::NotImplemented("precision mode".into()));
    }

    let operation = match &request.operation {
        Some(op) => MetricOp::from_str(op)
            .ok_or_else(|| ApiError::validation(format!("unknown operation: {op}")))?,
        None => MetricOp::Sum,
    };
    let metric_type = match &request.metric_type {
        Some(t) => MetricType::from_str(t)
            .ok_or_else(|| ApiError::validation(format!("unknown metric_type: {t}")))?,
        None => MetricType::Reset,
    };
    let flush_interval = request.flush_interval.unwrap_or_else(|| "tick_1m".to_string());
    if !state.tick_bus.is_supported(&flush_interval) {
        return Err(ApiError::validation(format!(
            "unsupported flush_interval: {flush_interval}"
        )));
    }
    let limit_operator = request
        .limit_operator
        .as_deref()
        .map(|op| {
            BreachOperator::from_str(op)
                .ok_or_else(|| ApiError::validation(format!("unknown limit_operator: {op}")))
        })
        .transpose()?;
    let breach_action = request
        .breach_action
        .as_deref()
        .map(|a| {
            BreachAction::from_str(a)
                .ok_or_else(|| ApiError::validation(format!("unknown breach_action: {a}")))
        })
        .transpose()?;

    let definition = MetricDefinition {
        account_id: account.clone(),
        metric_name: request.metric_name,
        mode: request.mode,
        operation,
        metric_type,
        flush_interval,
        initial_value: request.initial_value.unwrap_or(0.0),
        limit_value: request.limit_value,
        limit_operator,
        breach_action,
        webhook_urls: request.webhook_urls,
        adapters: request.adapters,
    };

    touch_metric(&state, &account, &definition.metric_name, Some(definition.clone())).await?;
    Ok(Json(definition))
}

#[derive(Debug, Deserialize)]
pub struct IncrementRequest {
    pub value: f64,
}

pub async fn increment_metric(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(metric_name): Path<String>,
    Query(query): Query<ScopeQuery>,
    Json(request): Json<IncrementRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = resolve_account(&principal, query.scope.as_deref(), query.customer_id.as_deref())?;
    let handle = touch_metric(&state, &account, &metric_name, None).await?;

    let current = handle.increment(request.value).await.map_err(ApiError::from)?;
    let snapshot = handle.snapshot().await.map_err(ApiError::from)?;
    let denied = snapshot.breached
        && snapshot
            .limit
            .as_ref()
            .map(|l| l.action == BreachAction::Deny)
            .unwrap_or(false);

    Ok(Json(serde_json::json!({
        "metric_name": metric_name,
        "current": current,
        "denied": denied,
    })))
}

pub async fn get_metric(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(metric_name): Path<String>,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = resolve_account(&principal, query.scope.as_deref(), query.customer_id.as_deref())?;
    let handle = touch_metric(&state, &account, &metric_name, None).await?;
    let snapshot = handle.snapshot().await.map_err(ApiError::from)?;

    Ok(Json(serde_json::json!({
        "metric_name": metric_name,
        "scope": account.scope(),
        "current": snapshot.current,
        "metric_type": snapshot.metric_type.as_str(),
        "flush_interval": snapshot.flush_interval,
        "is_breached": snapshot.breached,
        "limit_value": snapshot.limit.as_ref().map(|l| l.value),
    })))
}
