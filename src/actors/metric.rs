//! Metric actor: one task per `(account, metric)`.
//!
//! Owns the aggregation mode, flush policy, limit and breach state for a
//! single metric. Values live in the shared metric store; the actor is
//! the only writer for its key. On its subscribed tick the actor stages
//! its current value into the batch store and applies the metric type's
//! reset semantics. Breach side effects are edge-triggered: they fire on
//! the transition into breach and re-arm on reset.

use crate::actors::{recv_reply, ActorError, ActorRef, Reply};
use crate::clock::{self, Tick, TickPeriod};
use crate::limits::EffectiveLimit;
use crate::models::{
    AccountId, BreachAction, KeyType, MetricAdapters, MetricDefinition, MetricMode, MetricOp,
    MetricSample, MetricType,
};
use crate::registry::RegistryKey;
use crate::state::{AppState, METRICS_TABLE};
use crate::store::batch_store::StagedMetric;
use crate::store::StoreError;
use crate::billing::stripe::UsageRecord;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Point-in-time view of the actor's state.
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    pub current: f64,
    pub limit: Option<EffectiveLimit>,
    pub breached: bool,
    /// Number of healthy → breached transitions observed.
    pub breach_edges: u64,
    pub metric_type: MetricType,
    pub flush_interval: String,
    pub adapters: MetricAdapters,
}

pub enum MetricCommand {
    Increment {
        value: f64,
        reply: Reply<Result<f64, ActorError>>,
    },
    Current {
        reply: Reply<Result<f64, ActorError>>,
    },
    Snapshot {
        reply: Reply<MetricSnapshot>,
    },
    UpdateLimit {
        limit: Option<EffectiveLimit>,
        reply: Reply<()>,
    },
    /// Billing-cycle reset: back to the initial value with a persisted
    /// zero row. Arrives from customer actors, never from ticks.
    ResetCycle {
        reply: Reply<Result<(), ActorError>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

#[derive(Clone, Debug)]
pub struct MetricHandle {
    tx: mpsc::Sender<MetricCommand>,
    pub account_id: AccountId,
    pub metric_name: String,
}

impl MetricHandle {
    async fn send(&self, cmd: MetricCommand) -> Result<(), ActorError> {
        self.tx.send(cmd).await.map_err(|_| ActorError::Stopped)
    }

    pub async fn increment(&self, value: f64) -> Result<f64, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(MetricCommand::Increment { value, reply }).await?;
        recv_reply(rx).await?
    }

    pub async fn current(&self) -> Result<f64, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(MetricCommand::Current { reply }).await?;
        recv_reply(rx).await?
    }

    pub async fn snapshot(&self) -> Result<MetricSnapshot, ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(MetricCommand::Snapshot { reply }).await?;
        recv_reply(rx).await
    }

    pub async fn update_limit(&self, limit: Option<EffectiveLimit>) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(MetricCommand::UpdateLimit { limit, reply }).await?;
        recv_reply(rx).await
    }

    pub async fn reset_cycle(&self) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(MetricCommand::ResetCycle { reply }).await?;
        recv_reply(rx).await?
    }

    pub async fn shutdown(&self) -> Result<(), ActorError> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(MetricCommand::Shutdown { reply }).await?;
        recv_reply(rx).await
    }
}

pub struct MetricActor {
    state: Arc<AppState>,
    def: MetricDefinition,
    key: String,
    limit: Option<EffectiveLimit>,
    breached: bool,
    breach_edges: u64,
    /// Overage units already reported to the provider this cycle.
    reported_overage: f64,
    period: TickPeriod,
    stripe_secret: Option<String>,
}

impl MetricActor {
    fn storage_key(account: &AccountId, metric_name: &str) -> String {
        format!("{account}|{metric_name}")
    }

    fn registry_key(account: &AccountId, metric_name: &str) -> RegistryKey {
        RegistryKey::Metric {
            account: account.to_string(),
            name: metric_name.to_string(),
        }
    }

    /// Start the actor: restore the last durable value, seed the metric
    /// store and register. Call under the registry start lock for the
    /// metric's key.
    pub async fn spawn(
        state: Arc<AppState>,
        def: MetricDefinition,
        limit: Option<EffectiveLimit>,
    ) -> Result<MetricHandle, ActorError> {
        if def.mode == MetricMode::Precision {
            return Err(ActorError::NotImplemented("precision mode"));
        }
        if def.metric_type == MetricType::Checkpoint
            && !matches!(def.operation, MetricOp::Sum | MetricOp::Count)
        {
            return Err(ActorError::Invalid(
                "checkpoint metrics require SUM or COUNT".into(),
            ));
        }
        let Some(period) = clock::tick_period(&def.flush_interval) else {
            return Err(ActorError::Invalid(format!(
                "unsupported flush interval: {}",
                def.flush_interval
            )));
        };

        // Rehydrate from the row store; first start seeds the initial value.
        let restored = match def.metric_type {
            MetricType::Checkpoint => state
                .row_store
                .get_checkpoint(&def.account_id, &def.metric_name)
                .await,
            _ => state
                .row_store
                .latest_metric_value(&def.account_id, &def.metric_name)
                .await,
        }?
        .unwrap_or(def.initial_value);

        let key = Self::storage_key(&def.account_id, &def.metric_name);
        match state
            .metric_store
            .create(METRICS_TABLE, &key, def.operation, restored)
        {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                state.metric_store.reset(METRICS_TABLE, &key, restored)?;
            }
            Err(e) => return Err(e.into()),
        }

        let tick_rx = state
            .tick_bus
            .subscribe(&def.flush_interval)
            .ok_or_else(|| ActorError::Invalid(format!("no tick channel: {}", def.flush_interval)))?;

        let breached = limit.as_ref().map(|l| l.is_breached(restored)).unwrap_or(false);
        let (tx, rx) = mpsc::channel(64);
        let handle = MetricHandle {
            tx,
            account_id: def.account_id.clone(),
            metric_name: def.metric_name.clone(),
        };

        let registry_key = Self::registry_key(&def.account_id, &def.metric_name);
        state
            .registry
            .register(registry_key, ActorRef::Metric(handle.clone()))
            .map_err(|e| ActorError::Internal(e.to_string()))?;

        let actor = MetricActor {
            state,
            key,
            limit,
            breached,
            breach_edges: 0,
            reported_overage: 0.0,
            period,
            stripe_secret: None,
            def,
        };
        tokio::spawn(actor.run(rx, tick_rx));
        Ok(handle)
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<MetricCommand>,
        mut tick_rx: broadcast::Receiver<Tick>,
    ) {
        info!(
            account = %self.def.account_id,
            metric = %self.def.metric_name,
            flush = %self.def.flush_interval,
            "metric actor started"
        );
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        MetricCommand::Increment { value, reply } => {
                            let result = self.handle_increment(value).await;
                            let _ = reply.send(result);
                        }
                        MetricCommand::Current { reply } => {
                            let result = self
                                .state
                                .metric_store
                                .get(METRICS_TABLE, &self.key)
                                .map_err(Into::into);
                            let _ = reply.send(result);
                        }
                        MetricCommand::Snapshot { reply } => {
                            let current = self
                                .state
                                .metric_store
                                .get(METRICS_TABLE, &self.key)
                                .unwrap_or(self.def.initial_value);
                            let _ = reply.send(MetricSnapshot {
                                current,
                                limit: self.limit.clone(),
                                breached: self.breached,
                                breach_edges: self.breach_edges,
                                metric_type: self.def.metric_type,
                                flush_interval: self.def.flush_interval.clone(),
                                adapters: self.def.adapters.clone(),
                            });
                        }
                        MetricCommand::UpdateLimit { limit, reply } => {
                            self.limit = limit;
                            // Recompute without firing edge actions.
                            let current = self
                                .state
                                .metric_store
                                .get(METRICS_TABLE, &self.key)
                                .unwrap_or(self.def.initial_value);
                            self.breached = self
                                .limit
                                .as_ref()
                                .map(|l| l.is_breached(current))
                                .unwrap_or(false);
                            let _ = reply.send(());
                        }
                        MetricCommand::ResetCycle { reply } => {
                            let result = self.handle_reset_cycle().await;
                            let _ = reply.send(result);
                        }
                        MetricCommand::Shutdown { reply } => {
                            self.handle_shutdown();
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
                tick = tick_rx.recv() => {
                    match tick {
                        Ok(tick) => self.on_tick(tick).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(
                                metric = %self.def.metric_name,
                                missed,
                                "metric actor lagged behind tick bus"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!(
            account = %self.def.account_id,
            metric = %self.def.metric_name,
            "metric actor stopped"
        );
    }

    async fn handle_increment(&mut self, value: f64) -> Result<f64, ActorError> {
        let new_value = if self.def.metric_type == MetricType::Checkpoint {
            // Atomic upsert-and-increment in the row store, mirrored into
            // RAM, so concurrent writers across restarts never lose updates.
            let delta = match self.def.operation {
                MetricOp::Count => 1.0,
                _ => value,
            };
            let committed = self
                .state
                .row_store
                .checkpoint_increment(&self.def.account_id, &self.def.metric_name, delta)
                .await?;
            self.state
                .metric_store
                .reset(METRICS_TABLE, &self.key, committed)?;
            committed
        } else {
            self.state.metric_store.add(METRICS_TABLE, &self.key, value)?
        };

        if let Some(limit) = self.limit.clone() {
            let breached_now = limit.is_breached(new_value);
            if breached_now && !self.breached {
                self.breach_edges += 1;
                self.fire_breach_action(&limit, new_value);
            }
            self.breached = breached_now;
        }
        Ok(new_value)
    }

    fn fire_breach_action(&self, limit: &EffectiveLimit, current: f64) {
        match limit.action {
            BreachAction::Webhook => {
                let payload = serde_json::json!({
                    "event": "limit_breached",
                    "business_id": self.def.account_id.business_id,
                    "customer_id": self.def.account_id.customer_id,
                    "metric_name": self.def.metric_name,
                    "current_value": current,
                    "limit_value": limit.value,
                    "operator": limit.operator.as_str(),
                });
                if let Some(urls) = &limit.webhook_urls {
                    self.state
                        .notifier
                        .notify(&self.def.account_id.business_id, urls, payload);
                } else {
                    warn!(
                        metric = %self.def.metric_name,
                        "webhook breach action without webhook_urls"
                    );
                }
            }
            BreachAction::Log => {
                warn!(
                    account = %self.def.account_id,
                    metric = %self.def.metric_name,
                    current,
                    limit = limit.value,
                    "metric limit breached"
                );
            }
            // Deny is enforced by the gate; overage billing settles on
            // flush. The edge itself only flips state.
            BreachAction::Deny | BreachAction::AllowOverage => {
                debug!(
                    account = %self.def.account_id,
                    metric = %self.def.metric_name,
                    current,
                    "breach edge"
                );
            }
        }
    }

    async fn on_tick(&mut self, tick: Tick) {
        if tick.name != self.def.flush_interval {
            return;
        }
        let current = match self.state.metric_store.get(METRICS_TABLE, &self.key) {
            Ok(v) => v,
            Err(e) => {
                warn!(metric = %self.def.metric_name, error = %e, "tick skipped: no live value");
                return;
            }
        };

        let window_end = Utc
            .timestamp_opt(tick.unix_ts, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let staged = StagedMetric {
            account_id: self.def.account_id.clone(),
            metric_name: self.def.metric_name.clone(),
            value: current,
            // A re-stage after a failed flush replaces the previous value.
            operation: MetricOp::Last,
            metric_type: self.def.metric_type,
            adapters: (!self.def.adapters.is_empty()).then(|| self.def.adapters.clone()),
            window_start: clock::window_start(self.period, window_end),
            window_end,
        };
        if let Err(e) = self.state.batch_store.add_batch(&tick.name, staged) {
            warn!(metric = %self.def.metric_name, error = %e, "failed to stage batch");
            return;
        }

        self.report_overage(current, tick.unix_ts).await;

        if self.def.metric_type == MetricType::Reset {
            if let Err(e) =
                self.state
                    .metric_store
                    .reset(METRICS_TABLE, &self.key, self.def.initial_value)
            {
                warn!(metric = %self.def.metric_name, error = %e, "failed to reset after flush");
                return;
            }
            // Reset re-arms the breach edge without firing anything.
            self.breached = self
                .limit
                .as_ref()
                .map(|l| l.is_breached(self.def.initial_value))
                .unwrap_or(false);
            self.reported_overage = 0.0;
        }
    }

    /// Bill overage units accumulated past the limit. The tick timestamp
    /// doubles as the idempotency key so a re-fired tick cannot double-
    /// bill.
    async fn report_overage(&mut self, current: f64, tick_ts: i64) {
        let Some(limit) = &self.limit else { return };
        if limit.action != BreachAction::AllowOverage {
            return;
        }
        let Some(item_id) = self.def.adapters.stripe_subscription_item_id.clone() else {
            return;
        };
        let floor = self
            .def
            .adapters
            .overage_threshold
            .map(|t| t.max(limit.value))
            .unwrap_or(limit.value);
        let overage = (current - floor).max(0.0);
        let unreported = overage - self.reported_overage;
        if unreported < 1.0 {
            return;
        }

        let quantity = unreported.floor();
        let secret = match self.stripe_secret().await {
            Some(secret) => secret,
            None => {
                warn!(
                    metric = %self.def.metric_name,
                    "overage due but no stripe credentials configured"
                );
                return;
            }
        };
        let record = UsageRecord {
            subscription_item_id: item_id,
            quantity: quantity as u64,
            timestamp: tick_ts,
            idempotency_key: tick_ts.to_string(),
        };
        match self.state.stripe.report_usage(&secret, record).await {
            Ok(()) => {
                self.reported_overage += quantity;
                info!(
                    metric = %self.def.metric_name,
                    quantity,
                    "overage usage reported"
                );
            }
            Err(e) => {
                // Left unreported; the next flush retries the remainder.
                warn!(metric = %self.def.metric_name, error = %e, "overage report failed");
            }
        }
    }

    async fn stripe_secret(&mut self) -> Option<String> {
        if let Some(secret) = &self.stripe_secret {
            return Some(secret.clone());
        }
        if self.state.config.mock_mode {
            return Some("sk_mock".to_string());
        }
        if let Ok(Some(key)) = self
            .state
            .row_store
            .get_integration_key(&self.def.account_id.business_id, KeyType::Stripe, "secret_key")
            .await
        {
            if key.is_active {
                if let Ok(secret) = self.state.cipher.decrypt(&key.encrypted_key) {
                    self.stripe_secret = Some(secret.clone());
                    return Some(secret);
                }
            }
        }
        self.state.config.stripe_secret_key.clone()
    }

    async fn handle_reset_cycle(&mut self) -> Result<(), ActorError> {
        self.state
            .metric_store
            .reset(METRICS_TABLE, &self.key, self.def.initial_value)?;
        self.breached = self
            .limit
            .as_ref()
            .map(|l| l.is_breached(self.def.initial_value))
            .unwrap_or(false);
        self.reported_overage = 0.0;

        let sample = MetricSample {
            business_id: self.def.account_id.business_id.clone(),
            customer_id: self.def.account_id.customer_id.clone(),
            metric_name: self.def.metric_name.clone(),
            value: self.def.initial_value,
            metric_type: self.def.metric_type,
            scope: self.def.account_id.scope().to_string(),
            adapters: (!self.def.adapters.is_empty()).then(|| self.def.adapters.clone()),
            flushed_at: Utc::now(),
        };
        self.state.row_store.insert_metric_samples(&[sample]).await?;
        info!(
            account = %self.def.account_id,
            metric = %self.def.metric_name,
            "billing cycle reset"
        );
        Ok(())
    }

    fn handle_shutdown(&mut self) {
        if let Err(e) = self
            .state
            .batch_store
            .drain_metric(&self.def.account_id, &self.def.metric_name)
        {
            warn!(metric = %self.def.metric_name, error = %e, "failed to drain batches on shutdown");
        }
        let _ = self.state.metric_store.delete(METRICS_TABLE, &self.key);
        self.state
            .registry
            .unregister(&Self::registry_key(&self.def.account_id, &self.def.metric_name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::EffectiveLimit;
    use crate::models::{BreachOperator, LimitScope};
    use crate::testutil::test_state;
    use std::time::Duration;

    fn sum_def(metric_type: MetricType, flush: &str) -> MetricDefinition {
        MetricDefinition {
            account_id: AccountId::customer("biz_1", "cust_1"),
            metric_name: "api_calls".into(),
            mode: MetricMode::Simple,
            operation: MetricOp::Sum,
            metric_type,
            flush_interval: flush.into(),
            initial_value: 0.0,
            limit_value: None,
            limit_operator: None,
            breach_action: None,
            webhook_urls: None,
            adapters: MetricAdapters::default(),
        }
    }

    fn deny_limit(value: f64) -> EffectiveLimit {
        EffectiveLimit {
            value,
            operator: BreachOperator::Gte,
            action: BreachAction::Deny,
            webhook_urls: None,
            scope: LimitScope::Plan,
        }
    }

    #[tokio::test]
    async fn test_increment_monotonicity() {
        let (state, _tmp) = test_state().await;
        let handle = MetricActor::spawn(state, sum_def(MetricType::Reset, "tick_1m"), None)
            .await
            .unwrap();

        for i in 1..=5 {
            let v = handle.increment(2.0).await.unwrap();
            assert_eq!(v, (i as f64) * 2.0);
        }
        assert_eq!(handle.current().await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn test_precision_mode_not_implemented() {
        let (state, _tmp) = test_state().await;
        let mut def = sum_def(MetricType::Reset, "tick_1m");
        def.mode = MetricMode::Precision;

        let err = MetricActor::spawn(state, def, None).await.unwrap_err();
        assert!(matches!(err, ActorError::NotImplemented(_)));
    }

    #[tokio::test]
    async fn test_breach_edge_fires_once_until_reset() {
        let (state, _tmp) = test_state().await;
        let handle = MetricActor::spawn(
            state.clone(),
            sum_def(MetricType::Reset, "tick_1m"),
            Some(deny_limit(3.0)),
        )
        .await
        .unwrap();

        handle.increment(1.0).await.unwrap();
        handle.increment(1.0).await.unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert!(!snap.breached);
        assert_eq!(snap.breach_edges, 0);

        // Crossing the limit is a single edge.
        handle.increment(1.0).await.unwrap();
        handle.increment(1.0).await.unwrap();
        handle.increment(1.0).await.unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert!(snap.breached);
        assert_eq!(snap.breach_edges, 1);

        // A flush resets the value and re-arms the edge.
        state.tick_bus.trigger("tick_1m").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = handle.snapshot().await.unwrap();
        assert!(!snap.breached);
        assert_eq!(snap.current, 0.0);

        handle.increment(3.0).await.unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert!(snap.breached);
        assert_eq!(snap.breach_edges, 2);
    }

    #[tokio::test]
    async fn test_reset_metric_flush_stages_and_resets() {
        let (state, _tmp) = test_state().await;
        let handle = MetricActor::spawn(
            state.clone(),
            sum_def(MetricType::Reset, "tick_1m"),
            None,
        )
        .await
        .unwrap();

        handle.increment(7.0).await.unwrap();
        state.tick_bus.trigger("tick_1m").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Pre-reset value is staged for the drainer.
        let staged = state.batch_store.flush_interval("tick_1m").unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].aggregated_value, 7.0);
        assert_eq!(staged[0].metric_type, MetricType::Reset);

        // Live value is back at the initial value.
        assert_eq!(handle.current().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_checkpoint_increment_survives_respawn() {
        let (state, _tmp) = test_state().await;
        let def = sum_def(MetricType::Checkpoint, "tick_1h");
        let handle = MetricActor::spawn(state.clone(), def.clone(), None)
            .await
            .unwrap();

        for _ in 0..4 {
            handle.increment(1.0).await.unwrap();
        }
        assert_eq!(handle.current().await.unwrap(), 4.0);
        handle.shutdown().await.unwrap();

        // The restarted actor continues from the durable checkpoint.
        let handle = MetricActor::spawn(state, def, None).await.unwrap();
        assert_eq!(handle.current().await.unwrap(), 4.0);
        assert_eq!(handle.increment(1.0).await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn test_checkpoint_requires_additive_operation() {
        let (state, _tmp) = test_state().await;
        let mut def = sum_def(MetricType::Checkpoint, "tick_1h");
        def.operation = MetricOp::Last;

        let err = MetricActor::spawn(state, def, None).await.unwrap_err();
        assert!(matches!(err, ActorError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_restore_reproduces_last_persisted_value() {
        let (state, _tmp) = test_state().await;
        let def = sum_def(MetricType::Reset, "tick_1d");
        let sample = MetricSample {
            business_id: "biz_1".into(),
            customer_id: Some("cust_1".into()),
            metric_name: "api_calls".into(),
            value: 123.0,
            metric_type: MetricType::Reset,
            scope: "customer".into(),
            adapters: None,
            flushed_at: Utc::now(),
        };
        state.row_store.insert_metric_samples(&[sample]).await.unwrap();

        let handle = MetricActor::spawn(state, def, None).await.unwrap();
        assert_eq!(handle.current().await.unwrap(), 123.0);
    }

    #[tokio::test]
    async fn test_reset_cycle_persists_zero_row() {
        let (state, _tmp) = test_state().await;
        let def = sum_def(MetricType::StripeBilling, "tick_1h");
        let handle = MetricActor::spawn(state.clone(), def.clone(), Some(deny_limit(100.0)))
            .await
            .unwrap();

        handle.increment(42.0).await.unwrap();
        handle.reset_cycle().await.unwrap();

        assert_eq!(handle.current().await.unwrap(), 0.0);
        let latest = state
            .row_store
            .latest_metric_value(&def.account_id, "api_calls")
            .await
            .unwrap();
        assert_eq!(latest, Some(0.0));
    }

    #[tokio::test]
    async fn test_stripe_billing_does_not_reset_on_tick() {
        let (state, _tmp) = test_state().await;
        let handle = MetricActor::spawn(
            state.clone(),
            sum_def(MetricType::StripeBilling, "tick_1m"),
            None,
        )
        .await
        .unwrap();

        handle.increment(9.0).await.unwrap();
        state.tick_bus.trigger("tick_1m").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handle.current().await.unwrap(), 9.0);
        let staged = state.batch_store.flush_interval("tick_1m").unwrap();
        assert_eq!(staged[0].aggregated_value, 9.0);
    }

    #[tokio::test]
    async fn test_overage_reported_once_per_tick_ts() {
        let (state, _tmp) = test_state().await;
        let mut def = sum_def(MetricType::Reset, "tick_1m");
        def.metric_name = "overage_metric".into();
        def.adapters.stripe_subscription_item_id = Some("si_42".into());
        def.adapters.overage_threshold = Some(5.0);
        let limit = EffectiveLimit {
            value: 5.0,
            operator: BreachOperator::Gte,
            action: BreachAction::AllowOverage,
            webhook_urls: None,
            scope: LimitScope::Plan,
        };
        let handle = MetricActor::spawn(state.clone(), def, Some(limit))
            .await
            .unwrap();

        for _ in 0..12 {
            handle.increment(1.0).await.unwrap();
        }
        let tick = state.tick_bus.trigger("tick_1m").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reports = state.stripe.mock_usage_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].quantity, 7);
        assert_eq!(reports[0].idempotency_key, tick.unix_ts.to_string());
        assert_eq!(reports[0].subscription_item_id, "si_42");
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_unregisters() {
        let (state, _tmp) = test_state().await;
        let def = sum_def(MetricType::Reset, "tick_1m");
        let handle = MetricActor::spawn(state.clone(), def.clone(), None)
            .await
            .unwrap();

        handle.increment(3.0).await.unwrap();
        state.tick_bus.trigger("tick_1m").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.batch_store.flush_interval("tick_1m").unwrap().len(), 1);

        handle.shutdown().await.unwrap();
        assert!(state.batch_store.flush_interval("tick_1m").unwrap().is_empty());
        let key = MetricActor::registry_key(&def.account_id, &def.metric_name);
        assert!(state.registry.lookup(&key).is_none());
    }
}
