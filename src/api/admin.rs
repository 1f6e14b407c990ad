//! Ops endpoints: dead-lettered billing events and the like.

use crate::error::ApiError;
use crate::models::EventStatus;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct BillingEventQuery {
    pub status: Option<String>,
}

pub async fn list_billing_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BillingEventQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            EventStatus::from_str(s)
                .ok_or_else(|| ApiError::validation(format!("unknown status: {s}")))
        })
        .transpose()?;

    let events = state
        .row_store
        .list_billing_events(status)
        .await
        .map_err(ApiError::Internal)?;
    let count = events.len();
    Ok(Json(serde_json::json!({
        "billing_events": events,
        "count": count,
    })))
}
