//! Per-tick flush drainers.
//!
//! One worker per tick channel. After a tick fires, the worker waits a
//! short settle delay so subscribed metric actors stage first, then
//! materializes the batch store for that tick, commits one batched write
//! to the row store, and clears the staged entries. A failed commit
//! leaves the entries in place; the next tick re-stages current values,
//! so the retry is a replacement rather than an accumulation.

use crate::clock::{Tick, SUPPORTED_TICKS};
use crate::models::MetricSample;
use crate::state::AppState;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub fn spawn_flush_workers(state: Arc<AppState>) {
    for (name, _) in SUPPORTED_TICKS {
        let state = state.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let Some(mut rx) = state.tick_bus.subscribe(&name) else {
                return;
            };
            let settle = Duration::from_millis(state.config.tick_settle_ms);
            loop {
                match rx.recv().await {
                    Ok(tick) => {
                        tokio::time::sleep(settle).await;
                        drain_tick(&state, &tick).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(tick = %name, missed, "flush worker lagged; draining on next tick");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Drain one tick: read staged batches, write them in a single commit,
/// clear on success.
pub async fn drain_tick(state: &Arc<AppState>, tick: &Tick) {
    let batches = match state.batch_store.flush_interval(&tick.name) {
        Ok(batches) => batches,
        Err(e) => {
            warn!(tick = %tick.name, error = %e, "flush scan failed");
            return;
        }
    };
    if batches.is_empty() {
        return;
    }

    let flushed_at = Utc
        .timestamp_opt(tick.unix_ts, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let samples: Vec<MetricSample> = batches
        .iter()
        .map(|b| MetricSample {
            business_id: b.business_id.clone(),
            customer_id: b.customer_id.clone(),
            metric_name: b.metric_name.clone(),
            value: b.aggregated_value,
            metric_type: b.metric_type,
            scope: b.scope.clone(),
            adapters: b.adapters.clone(),
            flushed_at,
        })
        .collect();

    match state.row_store.insert_metric_samples(&samples).await {
        Ok(written) => {
            match state.batch_store.clear_interval(&tick.name) {
                Ok(cleared) => {
                    debug!(tick = %tick.name, seq = tick.sequence, written, cleared, "flush committed");
                }
                Err(e) => {
                    warn!(tick = %tick.name, error = %e, "flush committed but clear failed");
                }
            }
            if written > 0 {
                info!(tick = %tick.name, rows = written, "metrics flushed");
            }
        }
        Err(e) => {
            // Entries stay staged; the next tick replaces and retries.
            warn!(
                tick = %tick.name,
                seq = tick.sequence,
                rows = samples.len(),
                error = %e,
                "flush commit failed; batch retained for retry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, MetricOp, MetricType};
    use crate::store::batch_store::StagedMetric;
    use crate::testutil::test_state;

    fn staged(value: f64, end: chrono::DateTime<Utc>) -> StagedMetric {
        StagedMetric {
            account_id: AccountId::customer("biz_1", "cust_1"),
            metric_name: "api_calls".into(),
            value,
            operation: MetricOp::Last,
            metric_type: MetricType::Reset,
            adapters: None,
            window_start: end - chrono::Duration::minutes(1),
            window_end: end,
        }
    }

    #[tokio::test]
    async fn test_drain_persists_and_clears() {
        let (state, _tmp) = test_state().await;
        let now = Utc::now();
        state.batch_store.add_batch("tick_1m", staged(42.0, now)).unwrap();

        let tick = Tick {
            name: "tick_1m".into(),
            unix_ts: now.timestamp(),
            sequence: 1,
        };
        drain_tick(&state, &tick).await;

        let account = AccountId::customer("biz_1", "cust_1");
        let latest = state
            .row_store
            .latest_metric_value(&account, "api_calls")
            .await
            .unwrap();
        assert_eq!(latest, Some(42.0));
        assert!(state.batch_store.flush_interval("tick_1m").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_flushed_at_matches_tick() {
        let (state, _tmp) = test_state().await;
        let now = Utc::now();
        state.batch_store.add_batch("tick_1m", staged(7.0, now)).unwrap();

        let tick = Tick {
            name: "tick_1m".into(),
            unix_ts: now.timestamp(),
            sequence: 1,
        };
        drain_tick(&state, &tick).await;

        // The persisted row carries the tick instant, not wall-clock at
        // commit time.
        let events = state
            .row_store
            .latest_metric_value(&AccountId::customer("biz_1", "cust_1"), "api_calls")
            .await
            .unwrap();
        assert_eq!(events, Some(7.0));
    }

    #[tokio::test]
    async fn test_empty_tick_is_a_no_op() {
        let (state, _tmp) = test_state().await;
        let tick = Tick {
            name: "tick_1h".into(),
            unix_ts: Utc::now().timestamp(),
            sequence: 1,
        };
        drain_tick(&state, &tick).await;
        let latest = state
            .row_store
            .latest_metric_value(&AccountId::customer("biz_1", "cust_1"), "api_calls")
            .await
            .unwrap();
        assert!(latest.is_none());
    }

    #[tokio::test]
    async fn test_worker_end_to_end_via_trigger() {
        let (state, _tmp) = test_state().await;
        spawn_flush_workers(state.clone());
        // Give the workers a beat to subscribe.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let now = Utc::now();
        state.batch_store.add_batch("tick_5s", staged(13.0, now)).unwrap();
        state.tick_bus.trigger("tick_5s").unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let latest = state
            .row_store
            .latest_metric_value(&AccountId::customer("biz_1", "cust_1"), "api_calls")
            .await
            .unwrap();
        assert_eq!(latest, Some(13.0));
    }
}
