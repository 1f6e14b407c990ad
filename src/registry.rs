//! Process-wide actor registry.
//!
//! Maps composite keys to actor handles. Duplicate registration is an
//! error; callers that start actors lazily do so under the per-key start
//! lock so two concurrent lookups cannot spawn the same actor twice.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Composite registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistryKey {
    Application,
    Business(String),
    Customer {
        business_id: String,
        customer_id: String,
    },
    Metric {
        /// `business_id[/customer_id]` partition key.
        account: String,
        name: String,
    },
    Tick(String),
}

impl std::fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryKey::Application => write!(f, "application"),
            RegistryKey::Business(id) => write!(f, "business:{id}"),
            RegistryKey::Customer {
                business_id,
                customer_id,
            } => write!(f, "customer:{business_id}/{customer_id}"),
            RegistryKey::Metric { account, name } => write!(f, "metric:{account}/{name}"),
            RegistryKey::Tick(name) => write!(f, "tick:{name}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    Duplicate(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Duplicate(key) => write!(f, "already registered: {key}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Concurrent key → handle map. `H` is whatever cheap-to-clone handle the
/// caller stores (actor senders, tick channels).
pub struct ProcessRegistry<H: Clone> {
    entries: RwLock<HashMap<RegistryKey, H>>,
    start_locks: Mutex<HashMap<RegistryKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl<H: Clone> Default for ProcessRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone> ProcessRegistry<H> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            start_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, key: RegistryKey, handle: H) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(RegistryError::Duplicate(key.to_string()));
        }
        entries.insert(key, handle);
        Ok(())
    }

    pub fn lookup(&self, key: &RegistryKey) -> Option<H> {
        self.entries.read().get(key).cloned()
    }

    pub fn unregister(&self, key: &RegistryKey) -> Option<H> {
        self.start_locks.lock().remove(key);
        self.entries.write().remove(key)
    }

    /// Per-key mutex for check-and-start. Hold the guard across
    /// lookup-miss → spawn → register.
    pub fn start_lock(&self, key: &RegistryKey) -> Arc<tokio::sync::Mutex<()>> {
        self.start_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Snapshot of registered keys matching a predicate.
    pub fn keys_where(&self, pred: impl Fn(&RegistryKey) -> bool) -> Vec<RegistryKey> {
        self.entries
            .read()
            .keys()
            .filter(|k| pred(k))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_unregister() {
        let registry: ProcessRegistry<u32> = ProcessRegistry::new();
        let key = RegistryKey::Business("biz_1".into());

        assert!(registry.lookup(&key).is_none());
        registry.register(key.clone(), 7).unwrap();
        assert_eq!(registry.lookup(&key), Some(7));

        assert_eq!(registry.unregister(&key), Some(7));
        assert!(registry.lookup(&key).is_none());
    }

    #[test]
    fn test_duplicate_register_is_error() {
        let registry: ProcessRegistry<u32> = ProcessRegistry::new();
        let key = RegistryKey::Metric {
            account: "biz_1/cust_1".into(),
            name: "api_calls".into(),
        };

        registry.register(key.clone(), 1).unwrap();
        let err = registry.register(key, 2).unwrap_err();
        assert_eq!(
            err,
            RegistryError::Duplicate("metric:biz_1/cust_1/api_calls".into())
        );
    }

    #[test]
    fn test_key_display() {
        assert_eq!(RegistryKey::Application.to_string(), "application");
        assert_eq!(
            RegistryKey::Customer {
                business_id: "b".into(),
                customer_id: "c".into()
            }
            .to_string(),
            "customer:b/c"
        );
        assert_eq!(RegistryKey::Tick("tick_1m".into()).to_string(), "tick:tick_1m");
    }

    #[tokio::test]
    async fn test_start_lock_serializes_check_and_start() {
        let registry = Arc::new(ProcessRegistry::<u32>::new());
        let key = RegistryKey::Business("biz_1".into());

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let registry = registry.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let lock = registry.start_lock(&key);
                let _guard = lock.lock().await;
                if registry.lookup(&key).is_none() {
                    registry.register(key.clone(), i).unwrap();
                    true
                } else {
                    false
                }
            }));
        }

        let mut started = 0;
        for h in handles {
            if h.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_keys_where() {
        let registry: ProcessRegistry<u32> = ProcessRegistry::new();
        registry
            .register(RegistryKey::Business("a".into()), 1)
            .unwrap();
        registry
            .register(RegistryKey::Business("b".into()), 2)
            .unwrap();
        registry.register(RegistryKey::Tick("tick_1s".into()), 3).unwrap();

        let businesses =
            registry.keys_where(|k| matches!(k, RegistryKey::Business(_)));
        assert_eq!(businesses.len(), 2);
    }
}
