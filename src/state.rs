//! Shared service state threaded through actors, workers and handlers.

use crate::actors::ActorRef;
use crate::auth::KeyCipher;
use crate::billing::StripeClient;
use crate::clock::TickBus;
use crate::models::Config;
use crate::notify::WebhookNotifier;
use crate::registry::{ProcessRegistry, RegistryKey};
use crate::store::{BatchStore, MetricStore, RowStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Table in [`MetricStore`] holding live metric values.
pub const METRICS_TABLE: &str = "metrics";

pub struct AppState {
    pub config: Config,
    pub registry: ProcessRegistry<ActorRef>,
    pub metric_store: Arc<MetricStore>,
    pub batch_store: Arc<BatchStore>,
    pub row_store: Arc<dyn RowStore>,
    pub tick_bus: Arc<TickBus>,
    pub stripe: Arc<StripeClient>,
    pub notifier: Arc<WebhookNotifier>,
    pub cipher: Arc<KeyCipher>,
    /// Client used for gated proxy forwards.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, row_store: Arc<dyn RowStore>) -> Result<Self> {
        let metric_store = Arc::new(MetricStore::new());
        metric_store.create_table(METRICS_TABLE);
        let batch_store = Arc::new(BatchStore::new(metric_store.clone()));
        let timeout = Duration::from_secs(config.outbound_timeout_secs);
        let stripe = Arc::new(StripeClient::new(
            &config.stripe_api_base,
            config.mock_mode,
            timeout,
        ));
        let notifier = Arc::new(WebhookNotifier::new(timeout));
        let cipher = Arc::new(KeyCipher::from_base64(&config.encryption_key)?);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Ok(Self {
            config,
            registry: ProcessRegistry::new(),
            metric_store,
            batch_store,
            row_store,
            tick_bus: Arc::new(TickBus::new()),
            stripe,
            notifier,
            cipher,
            http,
        })
    }

    /// Root actor handle, if started.
    pub fn application(&self) -> Option<crate::actors::application::ApplicationHandle> {
        match self.registry.lookup(&RegistryKey::Application) {
            Some(ActorRef::Application(handle)) => Some(handle),
            _ => None,
        }
    }
}
