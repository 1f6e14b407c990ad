//! Customer actor: owns one customer's plan context and metric children.
//!
//! The plan-limit cache holds the effective resolution (customer override
//! over plan over business default) and is pushed into live metric actors
//! on every plan change. Children are started lazily through `Touch`.

use crate::actors::metric::{MetricActor, MetricHandle};
use crate::actors::{recv_reply, ActorError, ActorRef, Reply};
use crate::limits::{resolve_effective_limits, EffectiveLimit};
use crate::models::{
    AccountId, Customer, MetricAdapters, MetricDefinition, MetricMode, MetricOp, MetricType,
    PlanLimit,
};
use crate::registry::RegistryKey;
use crate::state::AppState;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEFAULT_FLUSH_INTERVAL: &str = "tick_1m";

pub enum CustomerCommand {
    /// Ensure the child metric actor exists, spawning it with limits
    /// injected from the cache.
    Touch {
        metric_name: String,
        definition: Option<MetricDefinition>,
        reply: Reply<Result<MetricHandle, ActorError>>,
    },
    /// Re-resolve plan limits and push them into live children. Does not
    /// replay history.
    RefreshPlan {
        reply: Reply<Result<(), ActorError>>,
    },
    /// Reset metered counters for a new billing cycle.
    ResetBillingCycle {
        reason: String,
        reply: Reply<Result<usize, ActorError>>,
    },
    /// Reassign to the business's distinguished free plan.
    DowngradeToFree {
        reply: Reply<Result<(), ActorError>>,
    },
    /// Link provider subscription state and refresh limits.
    LinkSubscription {
        plan_id: Option<String>,
        stripe_price_id: Option<String>,
        stripe_subscription_id: Option<String>,
        subscription_ends_at: Option<DateTime<Utc>>,
        reply: Reply<Result<(), ActorError>>,
    },
    Limits {
        reply: Reply<Vec<PlanLimit>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

#[derive(Clone, Debug)]
pub struct CustomerHandle {
    tx: mpsc::Sender<CustomerCommand>,
    pub business_id: String,
    pub customer_id: String,
}

impl CustomerHandle {
    async fn send(&self, cmd: CustomerCommand) -> Result<(), ActorError> {
        self.tx.send(cmd).await.map_err(|_| ActorError::Stopped)
    }

    pub async fn touch(
        &self,
        metric_name: &str,
        definition: Option<MetricDefinition>,
    ) -> Result<MetricHandle, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(CustomerCommand::Touch {
            metric_name: metric_name.to_string(),
            definition,
            reply,
        })
        .await?;
        recv_reply(rx).await?
    }

    pub async fn refresh_plan(&self) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(CustomerCommand::RefreshPlan { reply }).await?;
        recv_reply(rx).await?
    }

    pub async fn reset_billing_cycle(&self, reason: &str) -> Result<usize, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(CustomerCommand::ResetBillingCycle {
            reason: reason.to_string(),
            reply,
        })
        .await?;
        recv_reply(rx).await?
    }

    pub async fn downgrade_to_free(&self) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(CustomerCommand::DowngradeToFree { reply }).await?;
        recv_reply(rx).await?
    }

    pub async fn link_subscription(
        &self,
        plan_id: Option<String>,
        stripe_price_id: Option<String>,
        stripe_subscription_id: Option<String>,
        subscription_ends_at: Option<DateTime<Utc>>,
    ) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(CustomerCommand::LinkSubscription {
            plan_id,
            stripe_price_id,
            stripe_subscription_id,
            subscription_ends_at,
            reply,
        })
        .await?;
        recv_reply(rx).await?
    }

    pub async fn limits(&self) -> Result<Vec<PlanLimit>, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(CustomerCommand::Limits { reply }).await?;
        recv_reply(rx).await
    }

    pub async fn shutdown(&self) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(CustomerCommand::Shutdown { reply }).await?;
        recv_reply(rx).await
    }
}

pub struct CustomerActor {
    state: Arc<AppState>,
    customer: Customer,
    /// Effective limit per metric name.
    limits: HashMap<String, PlanLimit>,
    children: HashMap<String, MetricHandle>,
}

impl CustomerActor {
    fn registry_key(business_id: &str, customer_id: &str) -> RegistryKey {
        RegistryKey::Customer {
            business_id: business_id.to_string(),
            customer_id: customer_id.to_string(),
        }
    }

    pub async fn spawn(
        state: Arc<AppState>,
        business_id: &str,
        customer_id: &str,
    ) -> Result<CustomerHandle, ActorError> {
        let customer = state
            .row_store
            .get_customer(business_id, customer_id)
            .await?
            .filter(|c| c.deleted_at.is_none())
            .ok_or_else(|| {
                ActorError::NotFound(format!("customer {business_id}/{customer_id}"))
            })?;

        let limits = Self::load_limits(&state, &customer).await?;

        let (tx, rx) = mpsc::channel(64);
        let handle = CustomerHandle {
            tx,
            business_id: business_id.to_string(),
            customer_id: customer_id.to_string(),
        };
        state
            .registry
            .register(
                Self::registry_key(business_id, customer_id),
                ActorRef::Customer(handle.clone()),
            )
            .map_err(|e| ActorError::Internal(e.to_string()))?;

        let actor = CustomerActor {
            state,
            customer,
            limits,
            children: HashMap::new(),
        };
        tokio::spawn(actor.run(rx));
        Ok(handle)
    }

    async fn load_limits(
        state: &Arc<AppState>,
        customer: &Customer,
    ) -> Result<HashMap<String, PlanLimit>, ActorError> {
        let rows = state
            .row_store
            .list_plan_limits(
                &customer.business_id,
                customer.plan_id.as_deref(),
                Some(&customer.customer_id),
            )
            .await?;
        Ok(resolve_effective_limits(&rows))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<CustomerCommand>) {
        info!(
            business_id = %self.customer.business_id,
            customer_id = %self.customer.customer_id,
            plan = ?self.customer.plan_id,
            "customer actor started"
        );
        while let Some(cmd) = rx.recv().await {
            match cmd {
                CustomerCommand::Touch {
                    metric_name,
                    definition,
                    reply,
                } => {
                    let result = self.handle_touch(&metric_name, definition).await;
                    let _ = reply.send(result);
                }
                CustomerCommand::RefreshPlan { reply } => {
                    let result = self.handle_refresh_plan().await;
                    let _ = reply.send(result);
                }
                CustomerCommand::ResetBillingCycle { reason, reply } => {
                    let result = self.handle_reset_billing_cycle(&reason).await;
                    let _ = reply.send(result);
                }
                CustomerCommand::DowngradeToFree { reply } => {
                    let result = self.handle_downgrade_to_free().await;
                    let _ = reply.send(result);
                }
                CustomerCommand::LinkSubscription {
                    plan_id,
                    stripe_price_id,
                    stripe_subscription_id,
                    subscription_ends_at,
                    reply,
                } => {
                    let result = self
                        .handle_link_subscription(
                            plan_id,
                            stripe_price_id,
                            stripe_subscription_id,
                            subscription_ends_at,
                        )
                        .await;
                    let _ = reply.send(result);
                }
                CustomerCommand::Limits { reply } => {
                    let _ = reply.send(self.limits.values().cloned().collect());
                }
                CustomerCommand::Shutdown { reply } => {
                    for (_, child) in self.children.drain() {
                        let _ = child.shutdown().await;
                    }
                    self.state.registry.unregister(&Self::registry_key(
                        &self.customer.business_id,
                        &self.customer.customer_id,
                    ));
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn account_id(&self) -> AccountId {
        AccountId::customer(&self.customer.business_id, &self.customer.customer_id)
    }

    fn effective_limit(&self, metric_name: &str) -> Option<EffectiveLimit> {
        self.limits
            .get(metric_name)
            .map(EffectiveLimit::from_plan_limit)
    }

    async fn handle_touch(
        &mut self,
        metric_name: &str,
        definition: Option<MetricDefinition>,
    ) -> Result<MetricHandle, ActorError> {
        let account = self.account_id();
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
            self.children.insert(metric_name.to_string(), handle.clone());
            return Ok(handle);
        }

        let def = match definition {
            Some(def) => {
                self.state.row_store.upsert_metric_definition(&def).await?;
                def
            }
            None => match self
                .state
                .row_store
                .get_metric_definition(&account, metric_name)
                .await?
            {
                Some(def) => def,
                // Materialize from the limit alone: a plain counter whose
                // window is the limit period.
                None => {
                    let limit = self.limits.get(metric_name).ok_or_else(|| {
                        ActorError::NotFound(format!("metric {metric_name}"))
                    })?;
                    MetricDefinition {
                        account_id: account.clone(),
                        metric_name: metric_name.to_string(),
                        mode: MetricMode::Simple,
                        operation: MetricOp::Sum,
                        metric_type: limit.metric_type,
                        flush_interval: limit
                            .limit_period
                            .clone()
                            .unwrap_or_else(|| DEFAULT_FLUSH_INTERVAL.to_string()),
                        initial_value: 0.0,
                        limit_value: Some(limit.limit_value),
                        limit_operator: Some(limit.breach_operator),
                        breach_action: Some(limit.breach_action),
                        webhook_urls: limit.webhook_urls.clone(),
                        adapters: MetricAdapters::default(),
                    }
                }
            },
        };

        let limit = self.effective_limit(metric_name).or_else(|| {
            // A definition can carry its own standalone limit.
            def.limit_value.map(|value| EffectiveLimit {
                value,
                operator: def.limit_operator.unwrap_or(crate::models::BreachOperator::Gte),
                action: def.breach_action.unwrap_or(crate::models::BreachAction::Log),
                webhook_urls: def.webhook_urls.clone(),
                scope: crate::models::LimitScope::CustomerOverride,
            })
        });

        let handle = MetricActor::spawn(self.state.clone(), def, limit).await?;
        self.children.insert(metric_name.to_string(), handle.clone());
        Ok(handle)
    }

    async fn handle_refresh_plan(&mut self) -> Result<(), ActorError> {
        // The plan assignment may have changed under us; reload the row.
        if let Some(customer) = self
            .state
            .row_store
            .get_customer(&self.customer.business_id, &self.customer.customer_id)
            .await?
        {
            self.customer = customer;
        }
        self.limits = Self::load_limits(&self.state, &self.customer).await?;

        for (name, child) in &self.children {
            let limit = self.effective_limit(name);
            if let Err(e) = child.update_limit(limit).await {
                warn!(
                    customer_id = %self.customer.customer_id,
                    metric = %name,
                    error = %e,
                    "failed to push refreshed limit"
                );
            }
        }
        debug!(
            customer_id = %self.customer.customer_id,
            limits = self.limits.len(),
            "plan limits refreshed"
        );
        Ok(())
    }

    async fn handle_reset_billing_cycle(&mut self, reason: &str) -> Result<usize, ActorError> {
        // Metered metrics come from two places: plan limits of metered
        // type, and persisted definitions (stripe_billing accumulators
        // reset on cycle events even without a limit). Touch each so the
        // counter actually resets.
        let account = self.account_id();
        let mut metered: Vec<String> = Vec::new();
        for def in self.state.row_store.list_metric_definitions(&account).await? {
            if matches!(def.metric_type, MetricType::Reset | MetricType::StripeBilling) {
                metered.push(def.metric_name);
            }
        }
        for limit in self.limits.values() {
            if matches!(limit.metric_type, MetricType::Reset | MetricType::StripeBilling)
                && !metered.contains(&limit.metric_name)
            {
                metered.push(limit.metric_name.clone());
            }
        }
        for name in &metered {
            if !self.children.contains_key(name) {
                if let Ok(handle) = self.handle_touch(name, None).await {
                    self.children.insert(name.clone(), handle);
                }
            }
        }

        let mut reset = 0;
        for name in &metered {
            if let Some(child) = self.children.get(name) {
                match child.reset_cycle().await {
                    Ok(()) => reset += 1,
                    Err(e) => warn!(
                        customer_id = %self.customer.customer_id,
                        metric = %name,
                        error = %e,
                        "billing cycle reset failed"
                    ),
                }
            }
        }
        info!(
            business_id = %self.customer.business_id,
            customer_id = %self.customer.customer_id,
            reason,
            reset,
            "billing cycle reset"
        );
        Ok(reset)
    }

    async fn handle_downgrade_to_free(&mut self) -> Result<(), ActorError> {
        let free = self
            .state
            .row_store
            .get_free_plan(&self.customer.business_id)
            .await?
            .ok_or_else(|| {
                ActorError::NotFound(format!(
                    "free plan for business {}",
                    self.customer.business_id
                ))
            })?;

        self.state
            .row_store
            .update_customer_plan(
                &self.customer.business_id,
                &self.customer.customer_id,
                Some(&free.id),
                None,
                None,
                None,
            )
            .await?;
        info!(
            business_id = %self.customer.business_id,
            customer_id = %self.customer.customer_id,
            plan = %free.id,
            "customer downgraded to free plan"
        );
        self.handle_refresh_plan().await
    }

    async fn handle_link_subscription(
        &mut self,
        plan_id: Option<String>,
        stripe_price_id: Option<String>,
        stripe_subscription_id: Option<String>,
        subscription_ends_at: Option<DateTime<Utc>>,
    ) -> Result<(), ActorError> {
        self.state
            .row_store
            .update_customer_plan(
                &self.customer.business_id,
                &self.customer.customer_id,
                plan_id.as_deref(),
                stripe_price_id.as_deref(),
                stripe_subscription_id.as_deref(),
                subscription_ends_at,
            )
            .await?;
        self.handle_refresh_plan().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BreachAction, BreachOperator, Plan};
    use crate::testutil::test_state;

    async fn seed_customer(state: &Arc<AppState>, plan_id: Option<&str>) {
        let customer = Customer {
            business_id: "biz_1".into(),
            customer_id: "cust_1".into(),
            customer_name: "Customer One".into(),
            email: None,
            plan_id: plan_id.map(str::to_string),
            stripe_price_id: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            subscription_ends_at: None,
            user_id: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        state.row_store.insert_customer(&customer).await.unwrap();
    }

    fn plan_limit(
        id: &str,
        metric: &str,
        value: f64,
        plan: Option<&str>,
        cust: Option<&str>,
        metric_type: MetricType,
    ) -> PlanLimit {
        PlanLimit {
            id: id.into(),
            business_id: "biz_1".into(),
            plan_id: plan.map(str::to_string),
            customer_id: cust.map(str::to_string),
            metric_name: metric.into(),
            limit_value: value,
            limit_period: Some("tick_1d".into()),
            breach_operator: BreachOperator::Gte,
            breach_action: BreachAction::Deny,
            webhook_urls: None,
            metric_type,
        }
    }

    #[tokio::test]
    async fn test_spawn_requires_live_customer() {
        let (state, _tmp) = test_state().await;
        let err = CustomerActor::spawn(state.clone(), "biz_1", "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ActorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_touch_injects_limit_from_cache() {
        let (state, _tmp) = test_state().await;
        seed_customer(&state, Some("plan_pro")).await;
        state
            .row_store
            .insert_plan_limit(&plan_limit(
                "l1",
                "api_calls",
                1000.0,
                Some("plan_pro"),
                None,
                MetricType::Reset,
            ))
            .await
            .unwrap();

        let customer = CustomerActor::spawn(state.clone(), "biz_1", "cust_1")
            .await
            .unwrap();
        let metric = customer.touch("api_calls", None).await.unwrap();

        let snap = metric.snapshot().await.unwrap();
        let limit = snap.limit.unwrap();
        assert_eq!(limit.value, 1000.0);
        assert_eq!(limit.action, BreachAction::Deny);
    }

    #[tokio::test]
    async fn test_touch_without_definition_or_limit_is_not_found() {
        let (state, _tmp) = test_state().await;
        seed_customer(&state, None).await;

        let customer = CustomerActor::spawn(state.clone(), "biz_1", "cust_1")
            .await
            .unwrap();
        let err = customer.touch("unknown_metric", None).await.unwrap_err();
        assert!(matches!(err, ActorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_refresh_plan_pushes_new_limits() {
        let (state, _tmp) = test_state().await;
        seed_customer(&state, Some("plan_pro")).await;
        state
            .row_store
            .insert_plan_limit(&plan_limit(
                "l1",
                "api_calls",
                1000.0,
                Some("plan_pro"),
                None,
                MetricType::Reset,
            ))
            .await
            .unwrap();

        let customer = CustomerActor::spawn(state.clone(), "biz_1", "cust_1")
            .await
            .unwrap();
        let metric = customer.touch("api_calls", None).await.unwrap();
        assert_eq!(metric.snapshot().await.unwrap().limit.unwrap().value, 1000.0);

        // A customer override lands after the actor started.
        state
            .row_store
            .insert_plan_limit(&plan_limit(
                "l2",
                "api_calls",
                5000.0,
                None,
                Some("cust_1"),
                MetricType::Reset,
            ))
            .await
            .unwrap();
        customer.refresh_plan().await.unwrap();

        assert_eq!(metric.snapshot().await.unwrap().limit.unwrap().value, 5000.0);
    }

    #[tokio::test]
    async fn test_reset_billing_cycle_skips_checkpoints() {
        let (state, _tmp) = test_state().await;
        seed_customer(&state, Some("plan_pro")).await;
        for (id, metric, metric_type) in [
            ("l1", "api_calls", MetricType::Reset),
            ("l2", "minutes_used", MetricType::StripeBilling),
            ("l3", "lifetime_jobs", MetricType::Checkpoint),
        ] {
            state
                .row_store
                .insert_plan_limit(&plan_limit(
                    id,
                    metric,
                    100.0,
                    Some("plan_pro"),
                    None,
                    metric_type,
                ))
                .await
                .unwrap();
        }

        let customer = CustomerActor::spawn(state.clone(), "biz_1", "cust_1")
            .await
            .unwrap();
        let api_calls = customer.touch("api_calls", None).await.unwrap();
        let minutes = customer.touch("minutes_used", None).await.unwrap();
        api_calls.increment(10.0).await.unwrap();
        minutes.increment(20.0).await.unwrap();

        let reset = customer.reset_billing_cycle("invoice.finalized").await.unwrap();
        assert_eq!(reset, 2);
        assert_eq!(api_calls.current().await.unwrap(), 0.0);
        assert_eq!(minutes.current().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_downgrade_to_free_switches_plan_and_limits() {
        let (state, _tmp) = test_state().await;
        seed_customer(&state, Some("plan_pro")).await;
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
            .insert_plan_limit(&plan_limit(
                "l_pro",
                "api_calls",
                10_000.0,
                Some("plan_pro"),
                None,
                MetricType::Reset,
            ))
            .await
            .unwrap();
        state
            .row_store
            .insert_plan_limit(&plan_limit(
                "l_free",
                "api_calls",
                100.0,
                Some("plan_free"),
                None,
                MetricType::Reset,
            ))
            .await
            .unwrap();

        let customer = CustomerActor::spawn(state.clone(), "biz_1", "cust_1")
            .await
            .unwrap();
        let metric = customer.touch("api_calls", None).await.unwrap();
        assert_eq!(metric.snapshot().await.unwrap().limit.unwrap().value, 10_000.0);

        customer.downgrade_to_free().await.unwrap();

        let row = state
            .row_store
            .get_customer("biz_1", "cust_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.plan_id.as_deref(), Some("plan_free"));
        assert!(row.stripe_subscription_id.is_none());
        assert_eq!(metric.snapshot().await.unwrap().limit.unwrap().value, 100.0);
    }
}
