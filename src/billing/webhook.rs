//! Inbound billing webhooks.
//!
//! Every event is persisted before it is processed; the `event_id` is the
//! dedupe key and a row that already reached `completed` is acknowledged
//! without side effects. Processing failures are retried with exponential
//! backoff by a background worker until `MAX_EVENT_ATTEMPTS`, after which
//! the event parks in `failed` for the ops endpoint.

use crate::actors::customer::CustomerHandle;
use crate::billing::stripe::UsageRecord;
use crate::error::ApiError;
use crate::models::{AccountId, BillingEvent, EventStatus, KeyType, MetricType};
use crate::state::AppState;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_EVENT_ATTEMPTS: u32 = 5;
const RETRY_SCAN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub event_id: String,
    pub status: EventStatus,
    pub duplicate: bool,
}

/// HMAC-SHA256 over the raw body. Accepts either a bare hex digest or a
/// Stripe-style `t=...,v1=<hex>` header.
pub fn verify_signature(secret: &str, raw_body: &[u8], header: &str) -> bool {
    let hex_sig = header
        .split(',')
        .find_map(|part| part.trim().strip_prefix("v1="))
        .unwrap_or(header.trim());
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

async fn stored_secret(
    state: &Arc<AppState>,
    business_id: &str,
    key_name: &str,
) -> Result<Option<String>> {
    let Some(key) = state
        .row_store
        .get_integration_key(business_id, KeyType::Stripe, key_name)
        .await?
    else {
        return Ok(None);
    };
    if !key.is_active {
        return Ok(None);
    }
    Ok(Some(state.cipher.decrypt(&key.encrypted_key)?))
}

async fn stripe_secret(state: &Arc<AppState>, business_id: &str) -> Result<String> {
    if state.config.mock_mode {
        return Ok("sk_mock".to_string());
    }
    if let Some(secret) = stored_secret(state, business_id, "secret_key").await? {
        return Ok(secret);
    }
    state
        .config
        .stripe_secret_key
        .clone()
        .ok_or_else(|| anyhow!("no stripe credentials for business {business_id}"))
}

/// Ingress entry point. Persists, dedupes, verifies and processes one
/// event envelope.
pub async fn handle_webhook(
    state: Arc<AppState>,
    path_business_id: Option<String>,
    signature: Option<String>,
    raw_body: String,
) -> Result<WebhookAck, ApiError> {
    let payload: serde_json::Value = serde_json::from_str(&raw_body)
        .map_err(|_| ApiError::validation("webhook body is not valid json"))?;
    let event_id = payload["id"]
        .as_str()
        .ok_or_else(|| ApiError::validation("webhook event missing id"))?
        .to_string();
    let event_type = payload["type"]
        .as_str()
        .ok_or_else(|| ApiError::validation("webhook event missing type"))?
        .to_string();

    let business_id = path_business_id.or_else(|| {
        payload["data"]["object"]["metadata"]["business_id"]
            .as_str()
            .map(str::to_string)
    });

    // Signature check before any state change.
    if let Some(business_id) = &business_id {
        match stored_secret(&state, business_id, "webhook_secret").await {
            Ok(Some(secret)) => {
                let Some(signature) = &signature else {
                    return Err(ApiError::unauthorized("missing webhook signature"));
                };
                if !verify_signature(&secret, raw_body.as_bytes(), signature) {
                    return Err(ApiError::unauthorized("webhook signature mismatch"));
                }
            }
            Ok(None) if state.config.mock_mode => {
                debug!(business_id = %business_id, "mock mode: webhook signature skipped");
            }
            Ok(None) => {
                return Err(ApiError::unauthorized("no webhook secret configured"));
            }
            Err(e) => return Err(ApiError::Internal(e)),
        }
    } else if !state.config.mock_mode {
        return Err(ApiError::validation("webhook without business context"));
    }

    let envelope = BillingEvent {
        event_id: event_id.clone(),
        business_id: business_id.clone(),
        event_type: event_type.clone(),
        raw_payload: raw_body,
        status: EventStatus::Pending,
        retry_count: 0,
        error_message: None,
        received_at: Utc::now(),
    };
    let (inserted, existing_status) = state
        .row_store
        .insert_billing_event(&envelope)
        .await
        .map_err(ApiError::Internal)?;
    if !inserted && existing_status == EventStatus::Completed {
        // At-least-once delivery from the provider; ack without replay.
        info!(event_id = %event_id, "duplicate billing event acknowledged");
        return Ok(WebhookAck {
            event_id,
            status: EventStatus::Completed,
            duplicate: true,
        });
    }

    let status = attempt_event(&state, &event_id, &event_type, business_id.as_deref(), &payload, 0)
        .await
        .map_err(ApiError::Internal)?;
    Ok(WebhookAck {
        event_id,
        status,
        duplicate: false,
    })
}

/// One processing attempt with state transitions around it.
async fn attempt_event(
    state: &Arc<AppState>,
    event_id: &str,
    event_type: &str,
    business_id: Option<&str>,
    payload: &serde_json::Value,
    retry_count: u32,
) -> Result<EventStatus> {
    state
        .row_store
        .set_event_status(event_id, EventStatus::Processing, retry_count, None)
        .await?;

    match process_event(state, event_id, event_type, business_id, payload).await {
        Ok(()) => {
            state
                .row_store
                .set_event_status(event_id, EventStatus::Completed, retry_count, None)
                .await?;
            info!(event_id, event_type, "billing event completed");
            Ok(EventStatus::Completed)
        }
        Err(e) => {
            let attempts = retry_count + 1;
            let status = if attempts >= MAX_EVENT_ATTEMPTS {
                EventStatus::Failed
            } else {
                EventStatus::Pending
            };
            warn!(
                event_id,
                event_type,
                attempts,
                error = %e,
                "billing event attempt failed"
            );
            state
                .row_store
                .set_event_status(event_id, status, attempts, Some(&format!("{e:#}")))
                .await?;
            Ok(status)
        }
    }
}

async fn customer_handle(
    state: &Arc<AppState>,
    business_id: &str,
    customer_id: &str,
) -> Result<CustomerHandle> {
    let app = state
        .application()
        .ok_or_else(|| anyhow!("application actor not started"))?;
    let business = app.ensure_business(business_id).await?;
    Ok(business.ensure_customer(customer_id).await?)
}

async fn resolve_customer(
    state: &Arc<AppState>,
    business_id: &str,
    payload: &serde_json::Value,
) -> Result<crate::models::Customer> {
    let stripe_customer_id = payload["data"]["object"]["customer"]
        .as_str()
        .ok_or_else(|| anyhow!("event without customer reference"))?;
    state
        .row_store
        .find_customer_by_stripe(business_id, stripe_customer_id)
        .await?
        .ok_or_else(|| anyhow!("no customer for stripe id {stripe_customer_id}"))
}

async fn process_event(
    state: &Arc<AppState>,
    event_id: &str,
    event_type: &str,
    business_id: Option<&str>,
    payload: &serde_json::Value,
) -> Result<()> {
    let business_id = business_id.ok_or_else(|| anyhow!("event without business context"))?;

    match event_type {
        "invoice.finalized" => {
            let customer = resolve_customer(state, business_id, payload).await?;
            report_billing_usage(state, event_id, &customer).await?;
            let handle = customer_handle(state, business_id, &customer.customer_id).await?;
            handle.reset_billing_cycle("invoice.finalized").await?;
            Ok(())
        }
        "customer.subscription.created" | "customer.subscription.updated" => {
            let customer = resolve_customer(state, business_id, payload).await?;
            let object = &payload["data"]["object"];
            let subscription_status = object["status"].as_str().unwrap_or("active");
            let handle = customer_handle(state, business_id, &customer.customer_id).await?;

            if matches!(subscription_status, "past_due" | "canceled" | "unpaid") {
                handle.downgrade_to_free().await?;
                return Ok(());
            }

            let subscription_id = object["id"].as_str().map(str::to_string);
            let price_id = object["items"]["data"][0]["price"]["id"]
                .as_str()
                .map(str::to_string);
            let plan_id = match &price_id {
                Some(price) => state
                    .row_store
                    .find_plan_by_price(business_id, price)
                    .await?
                    .map(|p| p.id),
                None => None,
            };
            if plan_id.is_none() {
                warn!(
                    event_id,
                    business_id,
                    price = ?price_id,
                    "subscription price has no matching plan"
                );
            }
            handle
                .link_subscription(plan_id, price_id, subscription_id, None)
                .await?;
            Ok(())
        }
        "customer.subscription.deleted" => {
            let customer = resolve_customer(state, business_id, payload).await?;
            let handle = customer_handle(state, business_id, &customer.customer_id).await?;
            handle.downgrade_to_free().await?;
            Ok(())
        }
        "invoice.paid" => {
            // Free-tier customers have no finalized metered invoice; their
            // cycle resets on the paid (zero-amount) anniversary invoice.
            let customer = resolve_customer(state, business_id, payload).await?;
            let free = state.row_store.get_free_plan(business_id).await?;
            let on_free_plan = match (&customer.plan_id, free) {
                (Some(plan_id), Some(free)) => *plan_id == free.id,
                (None, _) => true,
                _ => false,
            };
            if on_free_plan {
                let handle = customer_handle(state, business_id, &customer.customer_id).await?;
                handle.reset_billing_cycle("invoice.paid").await?;
            }
            Ok(())
        }
        other => {
            debug!(event_id, event_type = other, "ignoring unhandled event type");
            Ok(())
        }
    }
}

/// Report accumulated `stripe_billing` usage for every metered metric the
/// customer carries. Idempotency is keyed per event and metric, so a
/// replayed event cannot double-report.
async fn report_billing_usage(
    state: &Arc<AppState>,
    event_id: &str,
    customer: &crate::models::Customer,
) -> Result<()> {
    let account = AccountId::customer(&customer.business_id, &customer.customer_id);
    let defs = state.row_store.list_metric_definitions(&account).await?;
    let secret = stripe_secret(state, &customer.business_id).await?;
    let handle = customer_handle(state, &customer.business_id, &customer.customer_id).await?;

    for def in defs
        .iter()
        .filter(|d| d.metric_type == MetricType::StripeBilling)
    {
        let Some(item_id) = def.adapters.stripe_subscription_item_id.clone() else {
            warn!(
                metric = %def.metric_name,
                "stripe_billing metric without subscription item adapter"
            );
            continue;
        };
        let metric = handle.touch(&def.metric_name, None).await?;
        let value = metric.current().await?;
        if value <= 0.0 {
            continue;
        }
        let record = UsageRecord {
            subscription_item_id: item_id,
            quantity: value.round() as u64,
            timestamp: Utc::now().timestamp(),
            idempotency_key: format!("{event_id}:{}", def.metric_name),
        };
        state
            .stripe
            .report_usage(&secret, record)
            .await
            .with_context(|| format!("usage report for {}", def.metric_name))?;
        info!(
            customer_id = %customer.customer_id,
            metric = %def.metric_name,
            quantity = value,
            "billing usage reported"
        );
    }
    Ok(())
}

/// Background retry pass for events that failed transiently. Backoff is
/// exponential in the attempt count, measured from receipt.
pub fn spawn_event_retry_worker(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETRY_SCAN_INTERVAL);
        loop {
            interval.tick().await;
            let pending = match state.row_store.list_billing_events(Some(EventStatus::Pending)).await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "event retry scan failed");
                    continue;
                }
            };
            for event in pending.into_iter().filter(|e| e.retry_count > 0) {
                let backoff =
                    Duration::from_secs(60u64.saturating_mul(1u64 << event.retry_count.min(6)));
                let due = event.received_at + chrono::Duration::from_std(backoff).unwrap_or_default();
                if Utc::now() < due {
                    continue;
                }
                let Ok(payload) = serde_json::from_str::<serde_json::Value>(&event.raw_payload)
                else {
                    let _ = state
                        .row_store
                        .set_event_status(
                            &event.event_id,
                            EventStatus::Failed,
                            event.retry_count,
                            Some("unparseable payload"),
                        )
                        .await;
                    continue;
                };
                if let Err(e) = attempt_event(
                    &state,
                    &event.event_id,
                    &event.event_type,
                    event.business_id.as_deref(),
                    &payload,
                    event.retry_count,
                )
                .await
                {
                    warn!(event_id = %event.event_id, error = %e, "event retry errored");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::application::ApplicationActor;
    use crate::models::{
        Business, Customer, MetricAdapters, MetricDefinition, MetricMode, MetricOp, MetricSample,
        Plan,
    };
    use crate::testutil::test_state;

    #[test]
    fn test_signature_verification_formats() {
        let secret = "whsec_test";
        let body = br#"{"id":"evt_1"}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        assert!(verify_signature(secret, body, &sig));
        assert!(verify_signature(secret, body, &format!("t=123,v1={sig}")));
        assert!(!verify_signature(secret, body, "deadbeef"));
        assert!(!verify_signature("wrong_secret", body, &sig));
        assert!(!verify_signature(secret, b"tampered", &sig));
    }

    async fn seed_tenant(state: &Arc<AppState>) {
        state
            .row_store
            .insert_business(&Business {
                business_id: "biz_1".into(),
                business_name: "Acme".into(),
                email: "ops@acme.test".into(),
                stripe_customer_id: None,
                subscription_status: None,
                plan_type: None,
                created_at: Utc::now(),
                deleted_at: None,
            })
            .await
            .unwrap();
        state
            .row_store
            .insert_plan(&Plan {
                id: "plan_free".into(),
                business_id: "biz_1".into(),
                plan_name: "free_plan".into(),
                stripe_price_id: None,
                plan_status: "active".into(),
            })
            .await
            .unwrap();
        state
            .row_store
            .insert_plan(&Plan {
                id: "plan_pro".into(),
                business_id: "biz_1".into(),
                plan_name: "pro".into(),
                stripe_price_id: Some("price_pro".into()),
                plan_status: "active".into(),
            })
            .await
            .unwrap();
        state
            .row_store
            .insert_customer(&Customer {
                business_id: "biz_1".into(),
                customer_id: "cust_1".into(),
                customer_name: "Customer".into(),
                email: None,
                plan_id: Some("plan_pro".into()),
                stripe_price_id: Some("price_pro".into()),
                stripe_customer_id: Some("cus_stripe_1".into()),
                stripe_subscription_id: Some("sub_1".into()),
                subscription_ends_at: None,
                user_id: None,
                created_at: Utc::now(),
                deleted_at: None,
            })
            .await
            .unwrap();
    }

    fn event_body(event_id: &str, event_type: &str) -> String {
        serde_json::json!({
            "id": event_id,
            "type": event_type,
            "data": {
                "object": {
                    "id": "sub_1",
                    "customer": "cus_stripe_1",
                    "status": "active",
                    "items": {"data": [{"price": {"id": "price_pro"}}]}
                }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_subscription_deleted_downgrades_to_free() {
        let (state, _tmp) = test_state().await;
        seed_tenant(&state).await;
        ApplicationActor::spawn(state.clone()).unwrap();

        let ack = handle_webhook(
            state.clone(),
            Some("biz_1".into()),
            None,
            event_body("evt_del", "customer.subscription.deleted"),
        )
        .await
        .unwrap();
        assert_eq!(ack.status, EventStatus::Completed);
        assert!(!ack.duplicate);

        let customer = state
            .row_store
            .get_customer("biz_1", "cust_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(customer.plan_id.as_deref(), Some("plan_free"));
        assert!(customer.stripe_subscription_id.is_none());
        assert!(customer.stripe_price_id.is_none());

        let event = state
            .row_store
            .get_billing_event("evt_del")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn test_subscription_created_links_plan_by_price() {
        let (state, _tmp) = test_state().await;
        seed_tenant(&state).await;
        ApplicationActor::spawn(state.clone()).unwrap();

        // Start the customer off-plan; the webhook links it back.
        state
            .row_store
            .update_customer_plan("biz_1", "cust_1", None, None, None, None)
            .await
            .unwrap();

        let ack = handle_webhook(
            state.clone(),
            Some("biz_1".into()),
            None,
            event_body("evt_sub", "customer.subscription.created"),
        )
        .await
        .unwrap();
        assert_eq!(ack.status, EventStatus::Completed);

        let customer = state
            .row_store
            .get_customer("biz_1", "cust_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(customer.plan_id.as_deref(), Some("plan_pro"));
        assert_eq!(customer.stripe_subscription_id.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn test_invoice_finalized_reports_and_resets_then_dedupes() {
        let (state, _tmp) = test_state().await;
        seed_tenant(&state).await;
        ApplicationActor::spawn(state.clone()).unwrap();

        let account = AccountId::customer("biz_1", "cust_1");
        let mut adapters = MetricAdapters::default();
        adapters.stripe_subscription_item_id = Some("si_99".into());
        state
            .row_store
            .upsert_metric_definition(&MetricDefinition {
                account_id: account.clone(),
                metric_name: "minutes_used".into(),
                mode: MetricMode::Simple,
                operation: MetricOp::Sum,
                metric_type: MetricType::StripeBilling,
                flush_interval: "tick_1h".into(),
                initial_value: 0.0,
                limit_value: None,
                limit_operator: None,
                breach_action: None,
                webhook_urls: None,
                adapters,
            })
            .await
            .unwrap();
        // The metric actor rehydrates this as the accumulated cycle usage.
        state
            .row_store
            .insert_metric_samples(&[MetricSample {
                business_id: "biz_1".into(),
                customer_id: Some("cust_1".into()),
                metric_name: "minutes_used".into(),
                value: 30.0,
                metric_type: MetricType::StripeBilling,
                scope: "customer".into(),
                adapters: None,
                flushed_at: Utc::now(),
            }])
            .await
            .unwrap();

        let body = event_body("evt_inv", "invoice.finalized");
        let ack = handle_webhook(state.clone(), Some("biz_1".into()), None, body.clone())
            .await
            .unwrap();
        assert_eq!(ack.status, EventStatus::Completed);

        let reports = state.stripe.mock_usage_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].quantity, 30);
        assert_eq!(reports[0].idempotency_key, "evt_inv:minutes_used");

        // Counter is reset after reporting.
        let latest = state
            .row_store
            .latest_metric_value(&account, "minutes_used")
            .await
            .unwrap();
        assert_eq!(latest, Some(0.0));

        // Replay: acknowledged, no extra report, single completed row.
        let ack = handle_webhook(state.clone(), Some("biz_1".into()), None, body)
            .await
            .unwrap();
        assert!(ack.duplicate);
        assert_eq!(ack.status, EventStatus::Completed);
        assert_eq!(state.stripe.mock_usage_reports().len(), 1);
    }

    #[tokio::test]
    async fn test_event_without_matching_customer_goes_pending() {
        let (state, _tmp) = test_state().await;
        seed_tenant(&state).await;
        ApplicationActor::spawn(state.clone()).unwrap();

        let body = serde_json::json!({
            "id": "evt_orphan",
            "type": "customer.subscription.deleted",
            "data": {"object": {"customer": "cus_unknown"}}
        })
        .to_string();
        let ack = handle_webhook(state.clone(), Some("biz_1".into()), None, body)
            .await
            .unwrap();
        assert_eq!(ack.status, EventStatus::Pending);

        let event = state
            .row_store
            .get_billing_event("evt_orphan")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.retry_count, 1);
        assert!(event.error_message.is_some());
    }

    #[tokio::test]
    async fn test_unknown_event_type_completes_without_side_effects() {
        let (state, _tmp) = test_state().await;
        seed_tenant(&state).await;
        ApplicationActor::spawn(state.clone()).unwrap();

        let body = serde_json::json!({
            "id": "evt_misc",
            "type": "charge.succeeded",
            "data": {"object": {"customer": "cus_stripe_1"}}
        })
        .to_string();
        let ack = handle_webhook(state.clone(), Some("biz_1".into()), None, body)
            .await
            .unwrap();
        assert_eq!(ack.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected_before_persisting() {
        let (state, _tmp) = test_state().await;
        let err = handle_webhook(state.clone(), Some("biz_1".into()), None, "not json".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
