//! Stripe API client.
//!
//! Only the two calls the core needs: metered usage records and the
//! subscription listing used by reconciliation. Under `MOCK_MODE` the
//! client records usage reports in memory instead of calling out, and
//! collapses duplicates by idempotency key the way the provider does.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// One metered usage report.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub subscription_item_id: String,
    pub quantity: u64,
    pub timestamp: i64,
    pub idempotency_key: String,
}

/// An active subscription as seen by the provider.
#[derive(Debug, Clone)]
pub struct RemoteSubscription {
    pub subscription_id: String,
    pub stripe_customer_id: String,
    pub price_id: Option<String>,
    pub status: String,
}

#[derive(Deserialize)]
struct SubscriptionList {
    data: Vec<SubscriptionObject>,
}

#[derive(Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: String,
    status: String,
    items: SubscriptionItems,
}

#[derive(Deserialize)]
struct SubscriptionItems {
    data: Vec<SubscriptionItem>,
}

#[derive(Deserialize)]
struct SubscriptionItem {
    price: Price,
}

#[derive(Deserialize)]
struct Price {
    id: String,
}

pub struct StripeClient {
    client: reqwest::Client,
    api_base: String,
    mock_mode: bool,
    /// Usage records captured in mock mode, deduped by idempotency key.
    mock_usage: Mutex<Vec<UsageRecord>>,
    mock_subscriptions: Mutex<Vec<RemoteSubscription>>,
}

impl StripeClient {
    pub fn new(api_base: &str, mock_mode: bool, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        if mock_mode {
            info!("stripe client running in mock mode");
        }
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            mock_mode,
            mock_usage: Mutex::new(Vec::new()),
            mock_subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Report metered usage. The caller passes the tick's Unix timestamp
    /// as the idempotency key so duplicate reports within a tick collapse
    /// provider-side.
    pub async fn report_usage(&self, secret_key: &str, record: UsageRecord) -> Result<()> {
        if self.mock_mode {
            let mut usage = self.mock_usage.lock();
            let duplicate = usage.iter().any(|r| {
                r.subscription_item_id == record.subscription_item_id
                    && r.idempotency_key == record.idempotency_key
            });
            if duplicate {
                debug!(
                    item = %record.subscription_item_id,
                    idempotency_key = %record.idempotency_key,
                    "mock stripe collapsed duplicate usage report"
                );
            } else {
                usage.push(record);
            }
            return Ok(());
        }

        let url = format!(
            "{}/v1/subscription_items/{}/usage_records",
            self.api_base, record.subscription_item_id
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(secret_key)
            .header("Idempotency-Key", &record.idempotency_key)
            .form(&[
                ("quantity", record.quantity.to_string()),
                ("timestamp", record.timestamp.to_string()),
                ("action", "increment".to_string()),
            ])
            .send()
            .await
            .context("usage record request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("stripe usage record rejected: {status} {body}"));
        }
        Ok(())
    }

    /// List the provider's active subscriptions, paging until exhausted.
    pub async fn list_active_subscriptions(
        &self,
        secret_key: &str,
    ) -> Result<Vec<RemoteSubscription>> {
        if self.mock_mode {
            return Ok(self.mock_subscriptions.lock().clone());
        }

        let mut subscriptions = Vec::new();
        let mut starting_after: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/v1/subscriptions?status=active&limit=100",
                self.api_base
            );
            if let Some(after) = &starting_after {
                url.push_str(&format!("&starting_after={after}"));
            }
            let resp = self
                .client
                .get(&url)
                .bearer_auth(secret_key)
                .send()
                .await
                .context("subscription list request failed")?;
            if !resp.status().is_success() {
                let status = resp.status();
                return Err(anyhow!("stripe subscription list rejected: {status}"));
            }
            let page: SubscriptionList = resp
                .json()
                .await
                .context("bad subscription list payload")?;
            let page_len = page.data.len();
            for sub in page.data {
                starting_after = Some(sub.id.clone());
                subscriptions.push(RemoteSubscription {
                    subscription_id: sub.id,
                    stripe_customer_id: sub.customer,
                    price_id: sub.items.data.first().map(|i| i.price.id.clone()),
                    status: sub.status,
                });
            }
            if page_len < 100 {
                break;
            }
        }
        Ok(subscriptions)
    }

    /// Usage reports captured in mock mode.
    pub fn mock_usage_reports(&self) -> Vec<UsageRecord> {
        self.mock_usage.lock().clone()
    }

    /// Seed subscriptions returned by `list_active_subscriptions` in mock
    /// mode.
    pub fn mock_set_subscriptions(&self, subscriptions: Vec<RemoteSubscription>) {
        *self.mock_subscriptions.lock() = subscriptions;
    }
}
