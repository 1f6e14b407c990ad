//! Business actor: owns a tenant's integration keys, customer children
//! and business-scope metrics.
//!
//! Key deactivation is the one place ordering matters: the hash must be
//! dropped from the auth cache synchronously before the call returns, so
//! a deactivated key can never authenticate out of the cache afterwards.

use crate::actors::application::ApplicationHandle;
use crate::actors::customer::{CustomerActor, CustomerHandle};
use crate::actors::metric::{MetricActor, MetricHandle};
use crate::actors::{recv_reply, ActorError, ActorRef, Reply};
use crate::auth::{generate_api_key, hash_key};
use crate::limits::{resolve_effective_limits, EffectiveLimit};
use crate::models::{AccountId, Business, IntegrationKey, KeyType, MetricDefinition};
use crate::registry::RegistryKey;
use crate::state::AppState;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// How long a deactivation waits for the auth cache acknowledgment.
const CACHE_UNREGISTER_WAIT: Duration = Duration::from_secs(1);

/// Inputs for issuing or storing a credential.
pub struct CreateKeyRequest {
    pub key_type: KeyType,
    pub key_name: String,
    pub customer_id: Option<String>,
    /// Present for stored provider credentials (stripe, fly); absent for
    /// generated API keys.
    pub credential: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A freshly issued key. `plaintext` is populated exactly once, for
/// generated API keys only.
#[derive(Debug)]
pub struct IssuedKey {
    pub key: IntegrationKey,
    pub plaintext: Option<String>,
}

pub enum BusinessCommand {
    EnsureCustomer {
        customer_id: String,
        reply: Reply<Result<CustomerHandle, ActorError>>,
    },
    TouchMetric {
        metric_name: String,
        definition: Option<MetricDefinition>,
        reply: Reply<Result<MetricHandle, ActorError>>,
    },
    CreateKey {
        request: CreateKeyRequest,
        reply: Reply<Result<IssuedKey, ActorError>>,
    },
    SetKeyActive {
        key_name: String,
        active: bool,
        reply: Reply<Result<(), ActorError>>,
    },
    ListKeys {
        reply: Reply<Result<Vec<IntegrationKey>, ActorError>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

#[derive(Clone, Debug)]
pub struct BusinessHandle {
    tx: mpsc::Sender<BusinessCommand>,
    pub business_id: String,
}

impl BusinessHandle {
    async fn send(&self, cmd: BusinessCommand) -> Result<(), ActorError> {
        self.tx.send(cmd).await.map_err(|_| ActorError::Stopped)
    }

    pub async fn ensure_customer(&self, customer_id: &str) -> Result<CustomerHandle, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(BusinessCommand::EnsureCustomer {
            customer_id: customer_id.to_string(),
            reply,
        })
        .await?;
        recv_reply(rx).await?
    }

    pub async fn touch_metric(
        &self,
        metric_name: &str,
        definition: Option<MetricDefinition>,
    ) -> Result<MetricHandle, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(BusinessCommand::TouchMetric {
            metric_name: metric_name.to_string(),
            definition,
            reply,
        })
        .await?;
        recv_reply(rx).await?
    }

    pub async fn create_key(&self, request: CreateKeyRequest) -> Result<IssuedKey, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(BusinessCommand::CreateKey { request, reply }).await?;
        recv_reply(rx).await?
    }

    pub async fn deactivate_key(&self, key_name: &str) -> Result<(), ActorError> {
        self.set_key_active(key_name, false).await
    }

    pub async fn set_key_active(&self, key_name: &str, active: bool) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(BusinessCommand::SetKeyActive {
            key_name: key_name.to_string(),
            active,
            reply,
        })
        .await?;
        recv_reply(rx).await?
    }

    pub async fn list_keys(&self) -> Result<Vec<IntegrationKey>, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(BusinessCommand::ListKeys { reply }).await?;
        recv_reply(rx).await?
    }

    pub async fn shutdown(&self) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(BusinessCommand::Shutdown { reply }).await?;
        recv_reply(rx).await
    }
}

pub struct BusinessActor {
    state: Arc<AppState>,
    business: Business,
    customers: HashMap<String, CustomerHandle>,
    metrics: HashMap<String, MetricHandle>,
}

impl BusinessActor {
    fn registry_key(business_id: &str) -> RegistryKey {
        RegistryKey::Business(business_id.to_string())
    }

    pub async fn spawn(state: Arc<AppState>, business_id: &str) -> Result<BusinessHandle, ActorError> {
        let business = state
            .row_store
            .get_business(business_id)
            .await?
            .filter(|b| b.deleted_at.is_none())
            .ok_or_else(|| ActorError::NotFound(format!("business {business_id}")))?;

        let (tx, rx) = mpsc::channel(64);
        let handle = BusinessHandle {
            tx,
            business_id: business_id.to_string(),
        };
        state
            .registry
            .register(Self::registry_key(business_id), ActorRef::Business(handle.clone()))
            .map_err(|e| ActorError::Internal(e.to_string()))?;

        let actor = BusinessActor {
            state,
            business,
            customers: HashMap::new(),
            metrics: HashMap::new(),
        };
        tokio::spawn(actor.run(rx));
        Ok(handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<BusinessCommand>) {
        info!(business_id = %self.business.business_id, "business actor started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                BusinessCommand::EnsureCustomer { customer_id, reply } => {
                    let result = self.handle_ensure_customer(&customer_id).await;
                    let _ = reply.send(result);
                }
                BusinessCommand::TouchMetric {
                    metric_name,
                    definition,
                    reply,
                } => {
                    let result = self.handle_touch_metric(&metric_name, definition).await;
                    let _ = reply.send(result);
                }
                BusinessCommand::CreateKey { request, reply } => {
                    let result = self.handle_create_key(request).await;
                    let _ = reply.send(result);
                }
                BusinessCommand::SetKeyActive {
                    key_name,
                    active,
                    reply,
                } => {
                    let result = self.handle_set_key_active(&key_name, active).await;
                    let _ = reply.send(result);
                }
                BusinessCommand::ListKeys { reply } => {
                    let result = self
                        .state
                        .row_store
                        .list_integration_keys(&self.business.business_id)
                        .await
                        .map_err(Into::into);
                    let _ = reply.send(result);
                }
                BusinessCommand::Shutdown { reply } => {
                    for (_, customer) in self.customers.drain() {
                        let _ = customer.shutdown().await;
                    }
                    for (_, metric) in self.metrics.drain() {
                        let _ = metric.shutdown().await;
                    }
                    self.state
                        .registry
                        .unregister(&Self::registry_key(&self.business.business_id));
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn application(&self) -> Option<ApplicationHandle> {
        self.state.application()
    }

    async fn handle_ensure_customer(
        &mut self,
        customer_id: &str,
    ) -> Result<CustomerHandle, ActorError> {
        let key = RegistryKey::Customer {
            business_id: self.business.business_id.clone(),
            customer_id: customer_id.to_string(),
        };
        if let Some(handle) = self.state.registry.lookup(&key).and_then(|r| r.as_customer()) {
            self.customers.insert(customer_id.to_string(), handle.clone());
            return Ok(handle);
        }
        let handle =
            CustomerActor::spawn(self.state.clone(), &self.business.business_id, customer_id)
                .await?;
        self.customers.insert(customer_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Business-scope metric (no customer id), limited by the business's
    /// default plan limits.
    async fn handle_touch_metric(
        &mut self,
        metric_name: &str,
        definition: Option<MetricDefinition>,
    ) -> Result<MetricHandle, ActorError> {
        let account = AccountId::business(&self.business.business_id);
        let registry_key = RegistryKey::Metric {
            account: account.to_string(),
            name: metric_name.to_string(),
        };
        if let Some(handle) = self
            .state
            .registry
            .lookup(&registry_key)
            .and_then(|r| r.as_metric())
        {
            self.metrics.insert(metric_name.to_string(), handle.clone());
            return Ok(handle);
        }

        let def = match definition {
            Some(def) => {
                self.state.row_store.upsert_metric_definition(&def).await?;
                def
            }
            None => self
                .state
                .row_store
                .get_metric_definition(&account, metric_name)
                .await?
                .ok_or_else(|| ActorError::NotFound(format!("metric {metric_name}")))?,
        };

        let rows = self
            .state
            .row_store
            .list_plan_limits(&self.business.business_id, None, None)
            .await?;
        let limit = resolve_effective_limits(&rows)
            .get(metric_name)
            .map(EffectiveLimit::from_plan_limit);

        let handle = MetricActor::spawn(self.state.clone(), def, limit).await?;
        self.metrics.insert(metric_name.to_string(), handle.clone());
        Ok(handle)
    }

    async fn handle_create_key(&mut self, request: CreateKeyRequest) -> Result<IssuedKey, ActorError> {
        if request.key_type == KeyType::CustomerApi && request.customer_id.is_none() {
            return Err(ActorError::Invalid(
                "customer_api keys require customer_id".into(),
            ));
        }

        let (plaintext, secret) = match request.credential {
            // Stored provider credential: nothing to hand back.
            Some(credential) => (None, credential),
            // Generated API key: returned to the caller exactly once.
            None => {
                let key = generate_api_key();
                (Some(key.clone()), key)
            }
        };

        let key_hash = hash_key(&secret);
        let encrypted_key = self.state.cipher.encrypt(&secret)?;
        let key = IntegrationKey {
            id: Uuid::new_v4().to_string(),
            business_id: self.business.business_id.clone(),
            customer_id: request.customer_id.clone(),
            key_type: request.key_type,
            key_name: request.key_name.clone(),
            encrypted_key,
            key_hash: key_hash.clone(),
            is_active: true,
            metadata: request.metadata,
            created_at: Utc::now(),
        };

        self.state
            .row_store
            .insert_integration_key(&key)
            .await
            .map_err(|e| {
                // The (business, type, name) uniqueness constraint is the
                // realistic failure here.
                ActorError::Conflict(format!("key insert failed: {e:#}"))
            })?;

        // Warm the auth cache for keys that authenticate requests.
        if let Some(app) = self.application() {
            match (request.key_type, &request.customer_id) {
                (KeyType::Business, _) => {
                    app.register_business_key(&key_hash, &self.business.business_id)
                        .await?;
                }
                (KeyType::CustomerApi, Some(customer_id)) => {
                    app.register_customer_key(&key_hash, &self.business.business_id, customer_id)
                        .await?;
                }
                _ => {}
            }
        }

        self.state
            .row_store
            .insert_audit_log(
                &self.business.business_id,
                "key.created",
                &format!("{}:{}", request.key_type.as_str(), request.key_name),
                None,
            )
            .await?;

        info!(
            business_id = %self.business.business_id,
            key_name = %request.key_name,
            key_type = request.key_type.as_str(),
            "integration key created"
        );
        Ok(IssuedKey { key, plaintext })
    }

    async fn handle_set_key_active(&mut self, key_name: &str, active: bool) -> Result<(), ActorError> {
        let key = self
            .state
            .row_store
            .set_key_active(&self.business.business_id, key_name, active)
            .await?
            .ok_or_else(|| ActorError::NotFound(format!("key {key_name}")))?;

        if let Some(app) = self.application() {
            if active {
                match (key.key_type, &key.customer_id) {
                    (KeyType::Business, _) => {
                        app.register_business_key(&key.key_hash, &self.business.business_id)
                            .await?;
                    }
                    (KeyType::CustomerApi, Some(customer_id)) => {
                        app.register_customer_key(
                            &key.key_hash,
                            &self.business.business_id,
                            customer_id,
                        )
                        .await?;
                    }
                    _ => {}
                }
            } else {
                // The cache drop must be acknowledged before we return;
                // on timeout the row-store deactivation stands but auth
                // may lag, which deserves a loud warning.
                match tokio::time::timeout(CACHE_UNREGISTER_WAIT, app.unregister_key(&key.key_hash))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!(
                            business_id = %self.business.business_id,
                            key_name,
                            "auth cache unregister timed out; key deactivated in store only"
                        );
                    }
                }
            }
        }

        self.state
            .row_store
            .insert_audit_log(
                &self.business.business_id,
                if active { "key.activated" } else { "key.deactivated" },
                key_name,
                None,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_state;

    async fn seed_business(state: &Arc<AppState>, id: &str) {
        let business = Business {
            business_id: id.to_string(),
            business_name: "Acme".into(),
            email: "ops@acme.test".into(),
            stripe_customer_id: None,
            subscription_status: None,
            plan_type: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        state.row_store.insert_business(&business).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_requires_live_business() {
        let (state, _tmp) = test_state().await;
        let err = BusinessActor::spawn(state, "missing").await.unwrap_err();
        assert!(matches!(err, ActorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_key_returns_plaintext_once_and_stores_hash() {
        let (state, _tmp) = test_state().await;
        seed_business(&state, "biz_1").await;
        let business = BusinessActor::spawn(state.clone(), "biz_1").await.unwrap();

        let issued = business
            .create_key(CreateKeyRequest {
                key_type: KeyType::Business,
                key_name: "primary".into(),
                customer_id: None,
                credential: None,
                metadata: None,
            })
            .await
            .unwrap();

        let plaintext = issued.plaintext.unwrap();
        assert!(plaintext.starts_with("tk_"));
        assert_eq!(issued.key.key_hash, hash_key(&plaintext));
        assert_ne!(issued.key.encrypted_key, plaintext);

        // Stored row holds ciphertext that decrypts back to the key.
        let stored = state
            .row_store
            .find_key_by_hash(&issued.key.key_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.cipher.decrypt(&stored.encrypted_key).unwrap(), plaintext);
    }

    #[tokio::test]
    async fn test_stored_credential_has_no_plaintext_reply() {
        let (state, _tmp) = test_state().await;
        seed_business(&state, "biz_1").await;
        let business = BusinessActor::spawn(state.clone(), "biz_1").await.unwrap();

        let issued = business
            .create_key(CreateKeyRequest {
                key_type: KeyType::Stripe,
                key_name: "secret_key".into(),
                customer_id: None,
                credential: Some("sk_live_abc".into()),
                metadata: None,
            })
            .await
            .unwrap();
        assert!(issued.plaintext.is_none());
        assert_eq!(
            state.cipher.decrypt(&issued.key.encrypted_key).unwrap(),
            "sk_live_abc"
        );
    }

    #[tokio::test]
    async fn test_customer_api_key_requires_customer_id() {
        let (state, _tmp) = test_state().await;
        seed_business(&state, "biz_1").await;
        let business = BusinessActor::spawn(state.clone(), "biz_1").await.unwrap();

        let err = business
            .create_key(CreateKeyRequest {
                key_type: KeyType::CustomerApi,
                key_name: "cust_primary".into(),
                customer_id: None,
                credential: None,
                metadata: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ActorError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_deactivate_key_marks_row_inactive() {
        let (state, _tmp) = test_state().await;
        seed_business(&state, "biz_1").await;
        let business = BusinessActor::spawn(state.clone(), "biz_1").await.unwrap();

        business
            .create_key(CreateKeyRequest {
                key_type: KeyType::Business,
                key_name: "primary".into(),
                customer_id: None,
                credential: None,
                metadata: None,
            })
            .await
            .unwrap();
        business.deactivate_key("primary").await.unwrap();

        let keys = business.list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(!keys[0].is_active);

        let err = business.deactivate_key("unknown").await.unwrap_err();
        assert!(matches!(err, ActorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ensure_customer_spawns_once() {
        let (state, _tmp) = test_state().await;
        seed_business(&state, "biz_1").await;
        let customer = crate::models::Customer {
            business_id: "biz_1".into(),
            customer_id: "cust_1".into(),
            customer_name: "Customer".into(),
            email: None,
            plan_id: None,
            stripe_price_id: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            subscription_ends_at: None,
            user_id: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        state.row_store.insert_customer(&customer).await.unwrap();

        let business = BusinessActor::spawn(state.clone(), "biz_1").await.unwrap();
        let first = business.ensure_customer("cust_1").await.unwrap();
        let second = business.ensure_customer("cust_1").await.unwrap();
        assert_eq!(first.customer_id, second.customer_id);

        // Exactly one customer actor registered.
        let keys = state
            .registry
            .keys_where(|k| matches!(k, RegistryKey::Customer { .. }));
        assert_eq!(keys.len(), 1);
    }
}
