//! Concurrent keyed aggregator over f64 values.
//!
//! The only mutable state shared between actors. Every operation is atomic
//! on a single key: entries live in sharded maps and each primitive holds
//! exactly one shard lock for its duration. `add` never implicitly creates
//! an entry; consumers decide create-vs-add under their own per-key guard.

use crate::models::MetricOp;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const SHARD_COUNT: usize = 16;

#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    TableNotFound(String),
    EntryNotFound(String),
    AlreadyExists(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::TableNotFound(t) => write!(f, "table not found: {t}"),
            StoreError::EntryNotFound(k) => write!(f, "entry not found: {k}"),
            StoreError::AlreadyExists(k) => write!(f, "entry already exists: {k}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone)]
struct Entry {
    op: MetricOp,
    value: f64,
    /// Running accumulator for `AVERAGE`.
    sum: f64,
    /// Sample count for `AVERAGE` and `COUNT`.
    count: u64,
}

impl Entry {
    fn new(op: MetricOp, initial: f64) -> Self {
        Self {
            op,
            value: initial,
            sum: 0.0,
            count: 0,
        }
    }

    fn apply(&mut self, value: f64) -> f64 {
        match self.op {
            MetricOp::Sum => self.value += value,
            MetricOp::Min => {
                if self.count == 0 || value < self.value {
                    self.value = value;
                }
            }
            MetricOp::Max => {
                if self.count == 0 || value > self.value {
                    self.value = value;
                }
            }
            MetricOp::Count => {
                // Value is ignored; each call counts one.
                self.value = (self.count + 1) as f64;
            }
            MetricOp::Average => {
                self.sum += value;
                self.value = self.sum / (self.count + 1) as f64;
            }
            MetricOp::Last => self.value = value,
        }
        self.count += 1;
        self.value
    }

    fn reset(&mut self, value: f64) {
        self.value = value;
        self.sum = 0.0;
        self.count = 0;
    }
}

struct Table {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
}

impl Table {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }
}

/// Named tables of sharded key → aggregate entries.
pub struct MetricStore {
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Create a table if it does not already exist.
    pub fn create_table(&self, table: &str) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Table::new()));
    }

    fn table(&self, table: &str) -> Result<Arc<Table>, StoreError> {
        self.tables
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    /// Initialize a key. Fails if the key already exists.
    pub fn create(
        &self,
        table: &str,
        key: &str,
        op: MetricOp,
        initial: f64,
    ) -> Result<(), StoreError> {
        let table = self.table(table)?;
        let mut shard = table.shard_for(key).lock();
        if shard.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        shard.insert(key.to_string(), Entry::new(op, initial));
        Ok(())
    }

    /// Apply the entry's operation and return the new value.
    pub fn add(&self, table: &str, key: &str, value: f64) -> Result<f64, StoreError> {
        let table = self.table(table)?;
        let mut shard = table.shard_for(key).lock();
        let entry = shard
            .get_mut(key)
            .ok_or_else(|| StoreError::EntryNotFound(key.to_string()))?;
        Ok(entry.apply(value))
    }

    pub fn get(&self, table: &str, key: &str) -> Result<f64, StoreError> {
        let table = self.table(table)?;
        let shard = table.shard_for(key).lock();
        shard
            .get(key)
            .map(|e| e.value)
            .ok_or_else(|| StoreError::EntryNotFound(key.to_string()))
    }

    pub fn reset(&self, table: &str, key: &str, value: f64) -> Result<(), StoreError> {
        let table = self.table(table)?;
        let mut shard = table.shard_for(key).lock();
        let entry = shard
            .get_mut(key)
            .ok_or_else(|| StoreError::EntryNotFound(key.to_string()))?;
        entry.reset(value);
        Ok(())
    }

    pub fn delete(&self, table: &str, key: &str) -> Result<(), StoreError> {
        let table = self.table(table)?;
        let mut shard = table.shard_for(key).lock();
        shard
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::EntryNotFound(key.to_string()))
    }

    /// Snapshot of all keys in a table. Order is unspecified.
    pub fn scan_keys(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let table = self.table(table)?;
        let mut keys = Vec::new();
        for shard in &table.shards {
            keys.extend(shard.lock().keys().cloned());
        }
        Ok(keys)
    }

    pub fn exists(&self, table: &str, key: &str) -> Result<bool, StoreError> {
        let table = self.table(table)?;
        let exists = table.shard_for(key).lock().contains_key(key);
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MetricStore {
        let s = MetricStore::new();
        s.create_table("metrics");
        s
    }

    #[test]
    fn test_missing_table_and_entry() {
        let s = store();
        assert_eq!(
            s.get("nope", "k"),
            Err(StoreError::TableNotFound("nope".into()))
        );
        assert_eq!(
            s.get("metrics", "k"),
            Err(StoreError::EntryNotFound("k".into()))
        );
        // add never implicitly creates
        assert_eq!(
            s.add("metrics", "k", 1.0),
            Err(StoreError::EntryNotFound("k".into()))
        );
    }

    #[test]
    fn test_create_is_exclusive() {
        let s = store();
        s.create("metrics", "k", MetricOp::Sum, 0.0).unwrap();
        assert_eq!(
            s.create("metrics", "k", MetricOp::Sum, 0.0),
            Err(StoreError::AlreadyExists("k".into()))
        );
    }

    #[test]
    fn test_sum_accumulates() {
        let s = store();
        s.create("metrics", "k", MetricOp::Sum, 0.0).unwrap();
        assert_eq!(s.add("metrics", "k", 1.5).unwrap(), 1.5);
        assert_eq!(s.add("metrics", "k", 2.5).unwrap(), 4.0);
        assert_eq!(s.get("metrics", "k").unwrap(), 4.0);
    }

    #[test]
    fn test_min_max_monotone() {
        let s = store();
        s.create("metrics", "lo", MetricOp::Min, 0.0).unwrap();
        // First sample replaces the initial value.
        assert_eq!(s.add("metrics", "lo", 5.0).unwrap(), 5.0);
        assert_eq!(s.add("metrics", "lo", 9.0).unwrap(), 5.0);
        assert_eq!(s.add("metrics", "lo", 2.0).unwrap(), 2.0);

        s.create("metrics", "hi", MetricOp::Max, 0.0).unwrap();
        assert_eq!(s.add("metrics", "hi", 5.0).unwrap(), 5.0);
        assert_eq!(s.add("metrics", "hi", 2.0).unwrap(), 5.0);
        assert_eq!(s.add("metrics", "hi", 9.0).unwrap(), 9.0);
    }

    #[test]
    fn test_count_ignores_value() {
        let s = store();
        s.create("metrics", "k", MetricOp::Count, 0.0).unwrap();
        assert_eq!(s.add("metrics", "k", 100.0).unwrap(), 1.0);
        assert_eq!(s.add("metrics", "k", -3.0).unwrap(), 2.0);
        assert_eq!(s.add("metrics", "k", 0.0).unwrap(), 3.0);
    }

    #[test]
    fn test_average_running() {
        let s = store();
        s.create("metrics", "k", MetricOp::Average, 0.0).unwrap();
        assert_eq!(s.add("metrics", "k", 10.0).unwrap(), 10.0);
        assert_eq!(s.add("metrics", "k", 20.0).unwrap(), 15.0);
        assert_eq!(s.add("metrics", "k", 30.0).unwrap(), 20.0);
    }

    #[test]
    fn test_last_replaces() {
        let s = store();
        s.create("metrics", "k", MetricOp::Last, 0.0).unwrap();
        assert_eq!(s.add("metrics", "k", 7.0).unwrap(), 7.0);
        assert_eq!(s.add("metrics", "k", 3.0).unwrap(), 3.0);
    }

    #[test]
    fn test_reset_clears_accumulators() {
        let s = store();
        s.create("metrics", "k", MetricOp::Average, 0.0).unwrap();
        s.add("metrics", "k", 10.0).unwrap();
        s.add("metrics", "k", 20.0).unwrap();

        s.reset("metrics", "k", 0.0).unwrap();
        assert_eq!(s.get("metrics", "k").unwrap(), 0.0);
        // Average restarts from scratch after reset.
        assert_eq!(s.add("metrics", "k", 6.0).unwrap(), 6.0);
    }

    #[test]
    fn test_delete_and_scan() {
        let s = store();
        s.create("metrics", "a", MetricOp::Sum, 0.0).unwrap();
        s.create("metrics", "b", MetricOp::Sum, 0.0).unwrap();

        let mut keys = s.scan_keys("metrics").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        s.delete("metrics", "a").unwrap();
        assert_eq!(s.scan_keys("metrics").unwrap(), vec!["b"]);
        assert_eq!(
            s.delete("metrics", "a"),
            Err(StoreError::EntryNotFound("a".into()))
        );
    }

    #[test]
    fn test_concurrent_single_key_increments() {
        let s = Arc::new(store());
        s.create("metrics", "k", MetricOp::Sum, 0.0).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    s.add("metrics", "k", 1.0).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.get("metrics", "k").unwrap(), 8000.0);
    }
}
