//! Daily reconciliation against the billing provider.
//!
//! Lists the provider's active subscriptions per business and compares
//! them to local plan assignments; drift is corrected through the
//! customer actors and every pass persists a reconciliation record.

use crate::models::{KeyType, ReconciliationRecord};
use crate::state::AppState;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Timelike, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Hour of day (UTC) the scheduled pass runs.
const RECONCILE_HOUR_UTC: u32 = 2;

/// One full pass over every business with a stripe integration.
pub async fn run_once(state: &Arc<AppState>) -> Result<ReconciliationRecord> {
    let mut totals = 0u64;
    let mut mismatches_found = 0u64;
    let mut mismatches_fixed = 0u64;
    let mut errors = 0u64;

    let app = state
        .application()
        .ok_or_else(|| anyhow::anyhow!("application actor not started"))?;

    for business in state.row_store.list_businesses().await? {
        let secret = if state.config.mock_mode {
            Some("sk_mock".to_string())
        } else {
            match state
                .row_store
                .get_integration_key(&business.business_id, KeyType::Stripe, "secret_key")
                .await
            {
                Ok(Some(key)) if key.is_active => state.cipher.decrypt(&key.encrypted_key).ok(),
                Ok(_) => None,
                Err(e) => {
                    warn!(business_id = %business.business_id, error = %e, "key lookup failed");
                    errors += 1;
                    continue;
                }
            }
        };
        let Some(secret) = secret else {
            continue;
        };

        let remote = match state.stripe.list_active_subscriptions(&secret).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(business_id = %business.business_id, error = %e, "subscription listing failed");
                errors += 1;
                continue;
            }
        };
        let local = state.row_store.list_customers(&business.business_id).await?;
        totals += local.len() as u64;

        for customer in &local {
            let Some(stripe_customer_id) = &customer.stripe_customer_id else {
                continue;
            };
            let remote_sub = remote
                .iter()
                .find(|r| &r.stripe_customer_id == stripe_customer_id);

            match remote_sub {
                Some(sub) => {
                    let subscription_matches = customer.stripe_subscription_id.as_deref()
                        == Some(sub.subscription_id.as_str())
                        && customer.stripe_price_id == sub.price_id;
                    if subscription_matches {
                        continue;
                    }
                    mismatches_found += 1;
                    let plan_id = match &sub.price_id {
                        Some(price) => state
                            .row_store
                            .find_plan_by_price(&business.business_id, price)
                            .await?
                            .map(|p| p.id),
                        None => None,
                    };
                    let result = async {
                        let handle = app
                            .ensure_business(&business.business_id)
                            .await?
                            .ensure_customer(&customer.customer_id)
                            .await?;
                        handle
                            .link_subscription(
                                plan_id,
                                sub.price_id.clone(),
                                Some(sub.subscription_id.clone()),
                                None,
                            )
                            .await
                    }
                    .await;
                    match result {
                        Ok(()) => {
                            mismatches_fixed += 1;
                            info!(
                                business_id = %business.business_id,
                                customer_id = %customer.customer_id,
                                subscription = %sub.subscription_id,
                                "subscription drift corrected"
                            );
                        }
                        Err(e) => {
                            errors += 1;
                            warn!(
                                business_id = %business.business_id,
                                customer_id = %customer.customer_id,
                                error = %e,
                                "failed to correct subscription drift"
                            );
                        }
                    }
                }
                None if customer.stripe_subscription_id.is_some() => {
                    // Provider no longer has this subscription active.
                    mismatches_found += 1;
                    let result = async {
                        let handle = app
                            .ensure_business(&business.business_id)
                            .await?
                            .ensure_customer(&customer.customer_id)
                            .await?;
                        handle.downgrade_to_free().await
                    }
                    .await;
                    match result {
                        Ok(()) => {
                            mismatches_fixed += 1;
                            info!(
                                business_id = %business.business_id,
                                customer_id = %customer.customer_id,
                                "stale subscription downgraded"
                            );
                        }
                        Err(e) => {
                            errors += 1;
                            warn!(
                                business_id = %business.business_id,
                                customer_id = %customer.customer_id,
                                error = %e,
                                "failed to downgrade stale subscription"
                            );
                        }
                    }
                }
                None => {}
            }
        }
    }

    let record = ReconciliationRecord {
        id: Uuid::new_v4().to_string(),
        record_type: "subscription_reconciliation".into(),
        totals,
        mismatches_found,
        mismatches_fixed,
        errors,
        ran_at: Utc::now(),
    };
    state.row_store.insert_reconciliation_record(&record).await?;
    info!(
        totals,
        mismatches_found, mismatches_fixed, errors, "reconciliation pass complete"
    );
    Ok(record)
}

/// Daily scheduler: sleeps until the next 02:00 UTC and runs a pass.
pub fn spawn_scheduler(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let mut next = now
                .date_naive()
                .and_hms_opt(RECONCILE_HOUR_UTC, 0, 0)
                .unwrap()
                .and_utc();
            if next <= now {
                next += ChronoDuration::days(1);
            }
            let wait = (next - now)
                .to_std()
                .unwrap_or_else(|_| std::time::Duration::from_secs(60));
            info!(
                next = %next,
                "reconciliation scheduled"
            );
            tokio::time::sleep(wait).await;

            if let Err(e) = run_once(&state).await {
                warn!(error = %e, "scheduled reconciliation failed");
            }
            // Skip past the boundary so one loop iteration fires once.
            if Utc::now().hour() == RECONCILE_HOUR_UTC {
                tokio::time::sleep(std::time::Duration::from_secs(61)).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::application::ApplicationActor;
    use crate::billing::stripe::RemoteSubscription;
    use crate::models::{Business, Customer, Plan};
    use crate::testutil::test_state;

    async fn seed(state: &Arc<AppState>) {
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
                stripe_customer_id: Some("cus_1".into()),
                stripe_subscription_id: Some("sub_old".into()),
                subscription_ends_at: None,
                user_id: None,
                created_at: Utc::now(),
                deleted_at: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_matching_state_records_clean_pass() {
        let (state, _tmp) = test_state().await;
        seed(&state).await;
        ApplicationActor::spawn(state.clone()).unwrap();
        state.stripe.mock_set_subscriptions(vec![RemoteSubscription {
            subscription_id: "sub_old".into(),
            stripe_customer_id: "cus_1".into(),
            price_id: Some("price_pro".into()),
            status: "active".into(),
        }]);

        let record = run_once(&state).await.unwrap();
        assert_eq!(record.totals, 1);
        assert_eq!(record.mismatches_found, 0);
        assert_eq!(record.errors, 0);
    }

    #[tokio::test]
    async fn test_drifted_subscription_is_corrected() {
        let (state, _tmp) = test_state().await;
        seed(&state).await;
        ApplicationActor::spawn(state.clone()).unwrap();
        // Provider sees a newer subscription id for the same customer.
        state.stripe.mock_set_subscriptions(vec![RemoteSubscription {
            subscription_id: "sub_new".into(),
            stripe_customer_id: "cus_1".into(),
            price_id: Some("price_pro".into()),
            status: "active".into(),
        }]);

        let record = run_once(&state).await.unwrap();
        assert_eq!(record.mismatches_found, 1);
        assert_eq!(record.mismatches_fixed, 1);

        let customer = state
            .row_store
            .get_customer("biz_1", "cust_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(customer.stripe_subscription_id.as_deref(), Some("sub_new"));
        assert_eq!(customer.plan_id.as_deref(), Some("plan_pro"));
    }

    #[tokio::test]
    async fn test_vanished_subscription_downgrades() {
        let (state, _tmp) = test_state().await;
        seed(&state).await;
        ApplicationActor::spawn(state.clone()).unwrap();
        state.stripe.mock_set_subscriptions(vec![]);

        let record = run_once(&state).await.unwrap();
        assert_eq!(record.mismatches_found, 1);
        assert_eq!(record.mismatches_fixed, 1);

        let customer = state
            .row_store
            .get_customer("biz_1", "cust_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(customer.plan_id.as_deref(), Some("plan_free"));
        assert!(customer.stripe_subscription_id.is_none());
    }
}
