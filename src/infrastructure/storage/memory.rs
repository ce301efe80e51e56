//! In-memory storage adapters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::snapshot::{DeltaCodec, Snapshot, ZstdDeltaCodec};
use crate::domain::ports::persistor::{AppendOptions, Persistor};
use crate::domain::ports::storage::{BaseStorage, StorageStats, StoredItem};

/// Map-backed item storage for tests and single-process runs.
pub struct InMemoryStorage<T> {
    items: RwLock<HashMap<String, StoredItem<T>>>,
}

impl<T> InMemoryStorage<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for InMemoryStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> BaseStorage<T> for InMemoryStorage<T> {
    async fn initialize(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn store(&self, item: StoredItem<T>) -> RuntimeResult<()> {
        let mut items = self.items.write().await;
        items.insert(item.id.clone(), item);
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> RuntimeResult<Option<StoredItem<T>>> {
        let now = Utc::now();
        let mut items = self.items.write().await;
        match items.get(id) {
            Some(item) if item.is_expired(now) => {
                // Lazy purge on read.
                items.remove(id);
                Ok(None)
            }
            Some(item) => Ok(Some(item.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> RuntimeResult<bool> {
        let mut items = self.items.write().await;
        Ok(items.remove(id).is_some())
    }

    async fn clear(&self) -> RuntimeResult<()> {
        let mut items = self.items.write().await;
        items.clear();
        Ok(())
    }

    async fn get_stats(&self) -> RuntimeResult<StorageStats> {
        let items = self.items.read().await;
        let item_count = items.len() as u64;
        // Size estimate; payloads are opaque so ids stand in.
        let total_size_bytes: u64 = items.keys().map(|k| k.len() as u64).sum();
        Ok(StorageStats {
            item_count,
            total_size_bytes,
            average_item_size_bytes: if item_count == 0 {
                0
            } else {
                total_size_bytes / item_count
            },
            adapter_type: "memory".to_string(),
        })
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn cleanup(&self) -> RuntimeResult<u64> {
        let now = Utc::now();
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, item| !item.is_expired(now));
        Ok((before - items.len()) as u64)
    }
}

struct StoredSnapshot {
    xc_id: String,
    ts: i64,
    codec: Option<&'static str>,
    body: Vec<u8>,
}

/// Map-backed snapshot store keyed by content hash.
pub struct InMemoryPersistor {
    snapshots: RwLock<HashMap<String, StoredSnapshot>>,
    codec: Arc<dyn DeltaCodec>,
}

impl InMemoryPersistor {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            codec: Arc::new(ZstdDeltaCodec::default()),
        }
    }

    pub fn with_codec(codec: Arc<dyn DeltaCodec>) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            codec,
        }
    }
}

impl Default for InMemoryPersistor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistor for InMemoryPersistor {
    async fn append(&self, snapshot: &Snapshot, options: AppendOptions) -> RuntimeResult<()> {
        let mut snapshots = self.snapshots.write().await;
        // Idempotent append: a known hash is a no-op.
        if snapshots.contains_key(&snapshot.hash) {
            return Ok(());
        }
        let raw = serde_json::to_vec(snapshot)?;
        let (codec, body) = if options.use_delta {
            (Some(self.codec.name()), self.codec.encode(&raw)?)
        } else {
            (None, raw)
        };
        snapshots.insert(
            snapshot.hash.clone(),
            StoredSnapshot {
                xc_id: snapshot.xc_id.clone(),
                ts: snapshot.ts,
                codec,
                body,
            },
        );
        Ok(())
    }

    async fn get_by_hash(&self, hash: &str) -> RuntimeResult<Option<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        let Some(stored) = snapshots.get(hash) else {
            return Ok(None);
        };
        let raw = match stored.codec {
            Some(_) => self.codec.decode(&stored.body)?,
            None => stored.body.clone(),
        };
        let snapshot: Snapshot =
            serde_json::from_slice(&raw).map_err(|e| RuntimeError::Serialization(e.to_string()))?;
        Ok(Some(snapshot))
    }

    async fn latest_for(&self, xc_id: &str) -> RuntimeResult<Option<Snapshot>> {
        let hash = {
            let snapshots = self.snapshots.read().await;
            snapshots
                .iter()
                .filter(|(_, s)| s.xc_id == xc_id)
                .max_by_key(|(_, s)| s.ts)
                .map(|(hash, _)| hash.clone())
        };
        match hash {
            Some(hash) => self.get_by_hash(&hash).await,
            None => Ok(None),
        }
    }

    async fn count(&self) -> RuntimeResult<u64> {
        Ok(self.snapshots.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_storage_round_trip_and_expiry() {
        let storage: InMemoryStorage<String> = InMemoryStorage::new();
        storage.initialize().await.unwrap();

        storage
            .store(StoredItem::new("a", "payload".to_string()))
            .await
            .unwrap();
        assert_eq!(
            storage.retrieve("a").await.unwrap().unwrap().payload,
            "payload"
        );

        storage
            .store(
                StoredItem::new("expired", "old".to_string())
                    .with_expiry(Utc::now() - Duration::seconds(1)),
            )
            .await
            .unwrap();
        // Lazy purge on read.
        assert!(storage.retrieve("expired").await.unwrap().is_none());
        assert_eq!(storage.get_stats().await.unwrap().item_count, 1);
    }

    #[tokio::test]
    async fn test_storage_cleanup_pass() {
        let storage: InMemoryStorage<u32> = InMemoryStorage::new();
        for i in 0..3 {
            storage
                .store(
                    StoredItem::new(format!("e{i}"), i)
                        .with_expiry(Utc::now() - Duration::seconds(1)),
                )
                .await
                .unwrap();
        }
        storage.store(StoredItem::new("keep", 9)).await.unwrap();

        assert_eq!(storage.cleanup().await.unwrap(), 3);
        assert_eq!(storage.get_stats().await.unwrap().item_count, 1);
        assert!(storage.delete("keep").await.unwrap());
        assert!(!storage.delete("keep").await.unwrap());
    }

    #[tokio::test]
    async fn test_persistor_idempotent_append() {
        let persistor = InMemoryPersistor::new();
        let snapshot = Snapshot::capture("t:j", json!({"k": 1}), vec![]).unwrap();

        persistor
            .append(&snapshot, AppendOptions::default())
            .await
            .unwrap();
        persistor
            .append(&snapshot, AppendOptions::default())
            .await
            .unwrap();
        assert_eq!(persistor.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persistor_delta_round_trip() {
        let persistor = InMemoryPersistor::new();
        let snapshot =
            Snapshot::capture("t:j", json!({"blob": "x".repeat(1024)}), vec![]).unwrap();
        persistor
            .append(&snapshot, AppendOptions { use_delta: true })
            .await
            .unwrap();

        let loaded = persistor.get_by_hash(&snapshot.hash).await.unwrap().unwrap();
        assert_eq!(loaded.state, snapshot.state);
        assert_eq!(loaded.hash, snapshot.hash);
        assert!(loaded.verify().unwrap());
    }

    #[tokio::test]
    async fn test_persistor_latest_for() {
        let persistor = InMemoryPersistor::new();
        let mut first = Snapshot::capture("t:j", json!({"v": 1}), vec![]).unwrap();
        first.ts = 100;
        let mut second = Snapshot::capture("t:j", json!({"v": 2}), vec![]).unwrap();
        second.ts = 200;
        let other = Snapshot::capture("t:other", json!({"v": 3}), vec![]).unwrap();

        for s in [&first, &second, &other] {
            persistor.append(s, AppendOptions::default()).await.unwrap();
        }

        let latest = persistor.latest_for("t:j").await.unwrap().unwrap();
        assert_eq!(latest.state["v"], 2);
        assert!(persistor.latest_for("t:missing").await.unwrap().is_none());
    }
}
