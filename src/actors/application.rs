//! Application actor: the root of the hierarchy.
//!
//! Owns the auth cache (key hash → principal), lazily starts business
//! children, and drives the best-effort final flush on shutdown. The
//! cache is mutated only through register/unregister messages, each
//! acknowledged on a reply channel, so deactivation has a synchronous
//! point of truth.
//!
//! Unregistering leaves a tombstone: a revoked hash answers 401 straight
//! from the cache, with no row-store lookup on the hot path.

use crate::actors::business::{BusinessActor, BusinessHandle};
use crate::actors::{recv_reply, ActorError, ActorRef, Reply};
use crate::clock::SUPPORTED_TICKS;
use crate::models::{KeyType, Principal};
use crate::registry::RegistryKey;
use crate::state::AppState;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Default)]
struct AuthCache {
    business_keys: HashMap<String, String>,
    customer_keys: HashMap<String, (String, String)>,
    /// Hashes explicitly unregistered; they never fall back to the row
    /// store again until re-registered.
    revoked: HashSet<String>,
}

pub enum ApplicationCommand {
    Authenticate {
        key_hash: String,
        reply: Reply<Result<Option<Principal>, ActorError>>,
    },
    RegisterBusinessKey {
        key_hash: String,
        business_id: String,
        reply: Reply<()>,
    },
    RegisterCustomerKey {
        key_hash: String,
        business_id: String,
        customer_id: String,
        reply: Reply<()>,
    },
    UnregisterKey {
        key_hash: String,
        reply: Reply<()>,
    },
    EnsureBusiness {
        business_id: String,
        reply: Reply<Result<BusinessHandle, ActorError>>,
    },
    /// Best-effort final flush: fire every tick channel once so metric
    /// actors stage and drainers drain.
    Shutdown {
        reply: Reply<()>,
    },
}

#[derive(Clone)]
pub struct ApplicationHandle {
    tx: mpsc::Sender<ApplicationCommand>,
}

impl ApplicationHandle {
    async fn send(&self, cmd: ApplicationCommand) -> Result<(), ActorError> {
        self.tx.send(cmd).await.map_err(|_| ActorError::Stopped)
    }

    pub async fn authenticate(&self, key_hash: &str) -> Result<Option<Principal>, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(ApplicationCommand::Authenticate {
            key_hash: key_hash.to_string(),
            reply,
        })
        .await?;
        recv_reply(rx).await?
    }

    pub async fn register_business_key(
        &self,
        key_hash: &str,
        business_id: &str,
    ) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(ApplicationCommand::RegisterBusinessKey {
            key_hash: key_hash.to_string(),
            business_id: business_id.to_string(),
            reply,
        })
        .await?;
        recv_reply(rx).await
    }

    pub async fn register_customer_key(
        &self,
        key_hash: &str,
        business_id: &str,
        customer_id: &str,
    ) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(ApplicationCommand::RegisterCustomerKey {
            key_hash: key_hash.to_string(),
            business_id: business_id.to_string(),
            customer_id: customer_id.to_string(),
            reply,
        })
        .await?;
        recv_reply(rx).await
    }

    pub async fn unregister_key(&self, key_hash: &str) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(ApplicationCommand::UnregisterKey {
            key_hash: key_hash.to_string(),
            reply,
        })
        .await?;
        recv_reply(rx).await
    }

    pub async fn ensure_business(&self, business_id: &str) -> Result<BusinessHandle, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(ApplicationCommand::EnsureBusiness {
            business_id: business_id.to_string(),
            reply,
        })
        .await?;
        recv_reply(rx).await?
    }

    pub async fn shutdown(&self) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(ApplicationCommand::Shutdown { reply }).await?;
        recv_reply(rx).await
    }
}

pub struct ApplicationActor {
    state: Arc<AppState>,
    cache: AuthCache,
}

impl ApplicationActor {
    pub fn spawn(state: Arc<AppState>) -> Result<ApplicationHandle, ActorError> {
        let (tx, rx) = mpsc::channel(256);
        let handle = ApplicationHandle { tx };
        state
            .registry
            .register(RegistryKey::Application, ActorRef::Application(handle.clone()))
            .map_err(|e| ActorError::Internal(e.to_string()))?;

        let actor = ApplicationActor {
            state,
            cache: AuthCache::default(),
        };
        tokio::spawn(actor.run(rx));
        Ok(handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ApplicationCommand>) {
        info!("application actor started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                ApplicationCommand::Authenticate { key_hash, reply } => {
                    let result = self.handle_authenticate(&key_hash).await;
                    let _ = reply.send(result);
                }
                ApplicationCommand::RegisterBusinessKey {
                    key_hash,
                    business_id,
                    reply,
                } => {
                    self.cache.revoked.remove(&key_hash);
                    self.cache.business_keys.insert(key_hash, business_id);
                    let _ = reply.send(());
                }
                ApplicationCommand::RegisterCustomerKey {
                    key_hash,
                    business_id,
                    customer_id,
                    reply,
                } => {
                    self.cache.revoked.remove(&key_hash);
                    self.cache
                        .customer_keys
                        .insert(key_hash, (business_id, customer_id));
                    let _ = reply.send(());
                }
                ApplicationCommand::UnregisterKey { key_hash, reply } => {
                    self.cache.business_keys.remove(&key_hash);
                    self.cache.customer_keys.remove(&key_hash);
                    self.cache.revoked.insert(key_hash);
                    let _ = reply.send(());
                }
                ApplicationCommand::EnsureBusiness { business_id, reply } => {
                    let result = self.handle_ensure_business(&business_id).await;
                    let _ = reply.send(result);
                }
                ApplicationCommand::Shutdown { reply } => {
                    for (name, _) in SUPPORTED_TICKS {
                        self.state.tick_bus.trigger(name);
                    }
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    async fn handle_authenticate(
        &mut self,
        key_hash: &str,
    ) -> Result<Option<Principal>, ActorError> {
        if self.cache.revoked.contains(key_hash) {
            return Ok(None);
        }
        if let Some(business_id) = self.cache.business_keys.get(key_hash) {
            return Ok(Some(Principal::Business {
                business_id: business_id.clone(),
            }));
        }
        if let Some((business_id, customer_id)) = self.cache.customer_keys.get(key_hash) {
            return Ok(Some(Principal::Customer {
                business_id: business_id.clone(),
                customer_id: customer_id.clone(),
            }));
        }

        // Lazy warm: one row-store lookup, cached on success.
        let Some(key) = self.state.row_store.find_key_by_hash(key_hash).await? else {
            return Ok(None);
        };
        if !key.is_active {
            self.cache.revoked.insert(key_hash.to_string());
            return Ok(None);
        }
        match (key.key_type, key.customer_id) {
            (KeyType::Business, _) => {
                self.cache
                    .business_keys
                    .insert(key_hash.to_string(), key.business_id.clone());
                debug!(business_id = %key.business_id, "auth cache warmed (business key)");
                Ok(Some(Principal::Business {
                    business_id: key.business_id,
                }))
            }
            (KeyType::CustomerApi, Some(customer_id)) => {
                self.cache.customer_keys.insert(
                    key_hash.to_string(),
                    (key.business_id.clone(), customer_id.clone()),
                );
                debug!(
                    business_id = %key.business_id,
                    customer_id = %customer_id,
                    "auth cache warmed (customer key)"
                );
                Ok(Some(Principal::Customer {
                    business_id: key.business_id,
                    customer_id,
                }))
            }
            // Provider credentials never authenticate requests.
            _ => Ok(None),
        }
    }

    async fn handle_ensure_business(
        &mut self,
        business_id: &str,
    ) -> Result<BusinessHandle, ActorError> {
        let key = RegistryKey::Business(business_id.to_string());
        if let Some(handle) = self.state.registry.lookup(&key).and_then(|r| r.as_business()) {
            return Ok(handle);
        }
        BusinessActor::spawn(self.state.clone(), business_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IntegrationKey;
    use crate::testutil::test_state;
    use chrono::Utc;

    async fn seed_key(
        state: &Arc<AppState>,
        key_hash: &str,
        key_type: KeyType,
        customer_id: Option<&str>,
        is_active: bool,
    ) {
        let key = IntegrationKey {
            id: uuid::Uuid::new_v4().to_string(),
            business_id: "biz_1".into(),
            customer_id: customer_id.map(str::to_string),
            key_type,
            key_name: format!("key_{key_hash}"),
            encrypted_key: "ct".into(),
            key_hash: key_hash.to_string(),
            is_active,
            metadata: None,
            created_at: Utc::now(),
        };
        state.row_store.insert_integration_key(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_lazy_warm_from_row_store() {
        let (state, _tmp) = test_state().await;
        seed_key(&state, "hash_biz", KeyType::Business, None, true).await;
        seed_key(&state, "hash_cust", KeyType::CustomerApi, Some("cust_1"), true).await;
        let app = ApplicationActor::spawn(state.clone()).unwrap();

        let principal = app.authenticate("hash_biz").await.unwrap().unwrap();
        assert_eq!(
            principal,
            Principal::Business {
                business_id: "biz_1".into()
            }
        );

        let principal = app.authenticate("hash_cust").await.unwrap().unwrap();
        assert_eq!(
            principal,
            Principal::Customer {
                business_id: "biz_1".into(),
                customer_id: "cust_1".into()
            }
        );

        assert!(app.authenticate("hash_unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inactive_key_never_authenticates() {
        let (state, _tmp) = test_state().await;
        seed_key(&state, "hash_dead", KeyType::Business, None, false).await;
        let app = ApplicationActor::spawn(state.clone()).unwrap();

        assert!(app.authenticate("hash_dead").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_provider_credentials_do_not_authenticate() {
        let (state, _tmp) = test_state().await;
        seed_key(&state, "hash_stripe", KeyType::Stripe, None, true).await;
        let app = ApplicationActor::spawn(state.clone()).unwrap();

        assert!(app.authenticate("hash_stripe").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unregister_tombstones_without_row_store_fallback() {
        let (state, _tmp) = test_state().await;
        // The row is active the whole time: if authenticate ever fell
        // back to the row store after unregister, it would succeed.
        seed_key(&state, "hash_live", KeyType::Business, None, true).await;
        let app = ApplicationActor::spawn(state.clone()).unwrap();

        assert!(app.authenticate("hash_live").await.unwrap().is_some());
        app.unregister_key("hash_live").await.unwrap();
        assert!(app.authenticate("hash_live").await.unwrap().is_none());

        // Re-registration clears the tombstone.
        app.register_business_key("hash_live", "biz_1").await.unwrap();
        assert!(app.authenticate("hash_live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ensure_business_is_idempotent() {
        let (state, _tmp) = test_state().await;
        let business = crate::models::Business {
            business_id: "biz_1".into(),
            business_name: "Acme".into(),
            email: "ops@acme.test".into(),
            stripe_customer_id: None,
            subscription_status: None,
            plan_type: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        state.row_store.insert_business(&business).await.unwrap();
        let app = ApplicationActor::spawn(state.clone()).unwrap();

        let first = app.ensure_business("biz_1").await.unwrap();
        let second = app.ensure_business("biz_1").await.unwrap();
        assert_eq!(first.business_id, second.business_id);
        assert_eq!(
            state
                .registry
                .keys_where(|k| matches!(k, RegistryKey::Business(_)))
                .len(),
            1
        );
    }
}
