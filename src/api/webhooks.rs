//! Billing provider webhook ingress.

use crate::billing::webhook::{handle_webhook, WebhookAck};
use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

fn signature_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Stripe-Signature")
        .or_else(|| headers.get("X-Webhook-Signature"))
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookAck>, ApiError> {
    let ack = handle_webhook(state, None, signature_header(&headers), body).await?;
    Ok(Json(ack))
}

pub async fn stripe_webhook_for_business(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookAck>, ApiError> {
    let ack = handle_webhook(state, Some(business_id), signature_header(&headers), body).await?;
    Ok(Json(ack))
}
