//! Outbound breach webhooks.
//!
//! Fire-and-forget fanout with bounded concurrency per business so one
//! tenant's slow endpoints cannot starve another's.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const PER_BUSINESS_CONCURRENCY: usize = 4;

pub struct WebhookNotifier {
    client: reqwest::Client,
    permits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            permits: Mutex::new(HashMap::new()),
        }
    }

    fn permits_for(&self, business_id: &str) -> Arc<Semaphore> {
        self.permits
            .lock()
            .entry(business_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(PER_BUSINESS_CONCURRENCY)))
            .clone()
    }

    /// Post `payload` to every URL in the background. Failures are logged
    /// and dropped; breach webhooks are best-effort by contract.
    pub fn notify(self: &Arc<Self>, business_id: &str, urls: &[String], payload: serde_json::Value) {
        for url in urls {
            let notifier = self.clone();
            let permits = self.permits_for(business_id);
            let url = url.clone();
            let business_id = business_id.to_string();
            let payload = payload.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                match notifier.client.post(&url).json(&payload).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(business_id = %business_id, url = %url, "breach webhook delivered");
                    }
                    Ok(resp) => {
                        warn!(
                            business_id = %business_id,
                            url = %url,
                            status = resp.status().as_u16(),
                            "breach webhook rejected"
                        );
                    }
                    Err(e) => {
                        warn!(business_id = %business_id, url = %url, error = %e, "breach webhook failed");
                    }
                }
            });
        }
    }
}
