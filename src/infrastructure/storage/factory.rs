//! Persistor factory with adapter caching.
//!
//! Adapters are keyed by `{adapter_type, connection_string, collection}`
//! and created lazily on first request; repeated requests for the same
//! key share one adapter.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::domain::errors::RuntimeResult;
use crate::domain::ports::persistor::Persistor;
use crate::infrastructure::storage::memory::InMemoryPersistor;
use crate::infrastructure::storage::sqlite::SqlitePersistor;

/// Supported persistor backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistorKind {
    Memory,
    Sqlite,
}

impl PersistorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }
}

/// Cache key for one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistorSpec {
    pub kind: PersistorKind,
    pub connection_string: String,
    pub collection: String,
}

impl PersistorSpec {
    pub fn memory() -> Self {
        Self {
            kind: PersistorKind::Memory,
            connection_string: String::new(),
            collection: String::new(),
        }
    }

    pub fn sqlite(connection_string: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            kind: PersistorKind::Sqlite,
            connection_string: connection_string.into(),
            collection: collection.into(),
        }
    }

    fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.kind.as_str(),
            self.connection_string,
            self.collection
        )
    }
}

/// Lazily-initializing, caching persistor factory.
pub struct PersistorFactory {
    adapters: Mutex<HashMap<String, Arc<dyn Persistor>>>,
}

impl PersistorFactory {
    pub fn new() -> Self {
        Self {
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or create the adapter for a spec.
    pub async fn get_or_create(&self, spec: &PersistorSpec) -> RuntimeResult<Arc<dyn Persistor>> {
        let key = spec.cache_key();
        let mut adapters = self.adapters.lock().await;
        if let Some(existing) = adapters.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let adapter: Arc<dyn Persistor> = match spec.kind {
            PersistorKind::Memory => Arc::new(InMemoryPersistor::new()),
            PersistorKind::Sqlite => Arc::new(
                SqlitePersistor::connect(&spec.connection_string, &spec.collection).await?,
            ),
        };
        adapters.insert(key, Arc::clone(&adapter));
        Ok(adapter)
    }

    pub async fn cached_count(&self) -> usize {
        self.adapters.lock().await.len()
    }
}

impl Default for PersistorFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::snapshot::Snapshot;
    use crate::domain::ports::persistor::AppendOptions;
    use serde_json::json;

    #[tokio::test]
    async fn test_factory_caches_by_key() {
        let factory = PersistorFactory::new();
        let spec = PersistorSpec::memory();

        let a = factory.get_or_create(&spec).await.unwrap();
        let b = factory.get_or_create(&spec).await.unwrap();
        assert_eq!(factory.cached_count().await, 1);

        // Same underlying adapter: a write through one is visible via the
        // other.
        let snapshot = Snapshot::capture("t:j", json!({"k": 1}), vec![]).unwrap();
        a.append(&snapshot, AppendOptions::default()).await.unwrap();
        assert!(b.get_by_hash(&snapshot.hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_factory_distinguishes_specs() {
        let factory = PersistorFactory::new();
        factory.get_or_create(&PersistorSpec::memory()).await.unwrap();
        factory
            .get_or_create(&PersistorSpec::sqlite("sqlite::memory:", "snapshots"))
            .await
            .unwrap();
        assert_eq!(factory.cached_count().await, 2);
    }
}
