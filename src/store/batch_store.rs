//! Per-tick staging area for the flush pipeline.
//!
//! A specialization of [`MetricStore`]: staged values live under composite
//! keys `tick|business|customer|metric|type` in a dedicated table, with a
//! side map for the window metadata the flush writer needs. Flush and
//! clear are separate steps; the pipeline clears only after the durable
//! write commits, so a failed commit leaves entries for the next tick.

use crate::models::{AccountId, MetricAdapters, MetricOp, MetricType};
use crate::store::metric_store::{MetricStore, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const BATCH_TABLE: &str = "batches";

/// One staged entry from a metric actor.
#[derive(Debug, Clone)]
pub struct StagedMetric {
    pub account_id: AccountId,
    pub metric_name: String,
    pub value: f64,
    /// Aggregation applied when the same key is staged again within one
    /// window. Actors staging a running current value use `Last` so a
    /// re-stage replaces rather than accumulates.
    pub operation: MetricOp,
    pub metric_type: MetricType,
    pub adapters: Option<MetricAdapters>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Materialized batch row handed to the durable writer.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricBatch {
    pub business_id: String,
    pub customer_id: Option<String>,
    pub metric_name: String,
    pub aggregated_value: f64,
    pub metric_type: MetricType,
    pub scope: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub adapters: Option<MetricAdapters>,
}

#[derive(Debug, Clone)]
struct BatchMeta {
    account_id: AccountId,
    metric_name: String,
    metric_type: MetricType,
    adapters: Option<MetricAdapters>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

pub struct BatchStore {
    store: Arc<MetricStore>,
    /// Guards create-vs-add and carries per-key window metadata.
    meta: Mutex<HashMap<String, BatchMeta>>,
}

impl BatchStore {
    pub fn new(store: Arc<MetricStore>) -> Self {
        store.create_table(BATCH_TABLE);
        Self {
            store,
            meta: Mutex::new(HashMap::new()),
        }
    }

    fn composite_key(tick: &str, staged: &StagedMetric) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            tick,
            staged.account_id.business_id,
            staged.account_id.customer_id.as_deref().unwrap_or("-"),
            staged.metric_name,
            staged.metric_type.as_str()
        )
    }

    /// Stage a value for the given tick, creating the entry on first sight
    /// and applying the staged operation afterwards.
    pub fn add_batch(&self, tick: &str, staged: StagedMetric) -> Result<f64, StoreError> {
        let key = Self::composite_key(tick, &staged);
        let mut meta = self.meta.lock();
        if meta.contains_key(&key) {
            let value = self.store.add(BATCH_TABLE, &key, staged.value)?;
            // Window advances to the most recent stage.
            if let Some(m) = meta.get_mut(&key) {
                m.window_end = staged.window_end;
                m.adapters = staged.adapters;
            }
            Ok(value)
        } else {
            self.store
                .create(BATCH_TABLE, &key, staged.operation, staged.value)?;
            meta.insert(
                key,
                BatchMeta {
                    account_id: staged.account_id,
                    metric_name: staged.metric_name,
                    metric_type: staged.metric_type,
                    adapters: staged.adapters,
                    window_start: staged.window_start,
                    window_end: staged.window_end,
                },
            );
            Ok(staged.value)
        }
    }

    fn keys_for(&self, tick: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{tick}|");
        Ok(self
            .store
            .scan_keys(BATCH_TABLE)?
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect())
    }

    /// Materialize every staged entry for the tick. Does not clear.
    pub fn flush_interval(&self, tick: &str) -> Result<Vec<MetricBatch>, StoreError> {
        let keys = self.keys_for(tick)?;
        let meta = self.meta.lock();
        let mut batches = Vec::with_capacity(keys.len());
        for key in keys {
            let value = self.store.get(BATCH_TABLE, &key)?;
            let Some(m) = meta.get(&key) else {
                continue;
            };
            batches.push(MetricBatch {
                business_id: m.account_id.business_id.clone(),
                customer_id: m.account_id.customer_id.clone(),
                metric_name: m.metric_name.clone(),
                aggregated_value: value,
                metric_type: m.metric_type,
                scope: m.account_id.scope().to_string(),
                window_start: m.window_start,
                window_end: m.window_end,
                adapters: m.adapters.clone(),
            });
        }
        Ok(batches)
    }

    /// Delete every staged entry for the tick. Call only after the flush
    /// write committed.
    pub fn clear_interval(&self, tick: &str) -> Result<usize, StoreError> {
        let keys = self.keys_for(tick)?;
        let mut meta = self.meta.lock();
        let mut cleared = 0;
        for key in keys {
            if self.store.delete(BATCH_TABLE, &key).is_ok() {
                meta.remove(&key);
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Drop staged entries owned by one metric across all ticks. Used by
    /// metric actor shutdown.
    pub fn drain_metric(&self, account_id: &AccountId, metric_name: &str) -> Result<usize, StoreError> {
        let infix = format!(
            "|{}|{}|{}|",
            account_id.business_id,
            account_id.customer_id.as_deref().unwrap_or("-"),
            metric_name
        );
        let keys: Vec<String> = self
            .store
            .scan_keys(BATCH_TABLE)?
            .into_iter()
            .filter(|k| k.contains(&infix))
            .collect();
        let mut meta = self.meta.lock();
        let mut drained = 0;
        for key in keys {
            if self.store.delete(BATCH_TABLE, &key).is_ok() {
                meta.remove(&key);
                drained += 1;
            }
        }
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn staged(value: f64) -> StagedMetric {
        let start = Utc.with_ymd_and_hms(2026, 3, 5, 14, 0, 0).unwrap();
        StagedMetric {
            account_id: AccountId::customer("biz_1", "cust_1"),
            metric_name: "api_calls".into(),
            value,
            operation: MetricOp::Last,
            metric_type: MetricType::Reset,
            adapters: None,
            window_start: start,
            window_end: start + chrono::Duration::minutes(1),
        }
    }

    fn batch_store() -> BatchStore {
        BatchStore::new(Arc::new(MetricStore::new()))
    }

    #[test]
    fn test_stage_and_flush_round_trip() {
        let bs = batch_store();
        bs.add_batch("tick_1m", staged(42.0)).unwrap();

        let batches = bs.flush_interval("tick_1m").unwrap();
        assert_eq!(batches.len(), 1);
        let b = &batches[0];
        assert_eq!(b.business_id, "biz_1");
        assert_eq!(b.customer_id.as_deref(), Some("cust_1"));
        assert_eq!(b.metric_name, "api_calls");
        assert_eq!(b.aggregated_value, 42.0);
        assert_eq!(b.scope, "customer");
    }

    #[test]
    fn test_restage_with_last_replaces() {
        let bs = batch_store();
        bs.add_batch("tick_1m", staged(42.0)).unwrap();
        let v = bs.add_batch("tick_1m", staged(50.0)).unwrap();
        assert_eq!(v, 50.0);

        let batches = bs.flush_interval("tick_1m").unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].aggregated_value, 50.0);
    }

    #[test]
    fn test_stage_with_sum_accumulates() {
        let bs = batch_store();
        let mut s = staged(10.0);
        s.operation = MetricOp::Sum;
        bs.add_batch("tick_1m", s.clone()).unwrap();
        s.value = 5.0;
        let v = bs.add_batch("tick_1m", s).unwrap();
        assert_eq!(v, 15.0);
    }

    #[test]
    fn test_flush_does_not_clear() {
        let bs = batch_store();
        bs.add_batch("tick_1m", staged(42.0)).unwrap();

        assert_eq!(bs.flush_interval("tick_1m").unwrap().len(), 1);
        // Entries survive a flush; they go away only on clear.
        assert_eq!(bs.flush_interval("tick_1m").unwrap().len(), 1);

        assert_eq!(bs.clear_interval("tick_1m").unwrap(), 1);
        assert!(bs.flush_interval("tick_1m").unwrap().is_empty());
    }

    #[test]
    fn test_ticks_are_isolated() {
        let bs = batch_store();
        bs.add_batch("tick_1m", staged(1.0)).unwrap();
        bs.add_batch("tick_1h", staged(2.0)).unwrap();

        assert_eq!(bs.flush_interval("tick_1m").unwrap().len(), 1);
        assert_eq!(bs.flush_interval("tick_1h").unwrap().len(), 1);

        bs.clear_interval("tick_1m").unwrap();
        assert!(bs.flush_interval("tick_1m").unwrap().is_empty());
        assert_eq!(bs.flush_interval("tick_1h").unwrap().len(), 1);
    }

    #[test]
    fn test_drain_metric_across_ticks() {
        let bs = batch_store();
        bs.add_batch("tick_1m", staged(1.0)).unwrap();
        bs.add_batch("tick_1h", staged(2.0)).unwrap();

        let other = StagedMetric {
            metric_name: "storage_bytes".into(),
            ..staged(3.0)
        };
        bs.add_batch("tick_1m", other).unwrap();

        let drained = bs
            .drain_metric(&AccountId::customer("biz_1", "cust_1"), "api_calls")
            .unwrap();
        assert_eq!(drained, 2);
        let left = bs.flush_interval("tick_1m").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].metric_name, "storage_bytes");
    }
}
