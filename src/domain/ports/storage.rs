//! Generic storage adapter port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::RuntimeResult;

/// Expiry metadata attached to stored items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageItemMetadata {
    /// Absolute expiry time; expired items are purged lazily on read and
    /// eagerly by the periodic cleanup pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
}

/// Envelope every stored item travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredItem<T> {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StorageItemMetadata>,
    pub payload: T,
}

impl<T> StoredItem<T> {
    pub fn new(id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            metadata: None,
            payload,
        }
    }

    pub fn with_expiry(mut self, expire_at: DateTime<Utc>) -> Self {
        self.metadata = Some(StorageItemMetadata {
            expire_at: Some(expire_at),
        });
        self
    }

    /// Whether the item has passed its expiry time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.expire_at)
            .is_some_and(|at| at <= now)
    }
}

/// Statistics reported by a storage adapter.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub item_count: u64,
    pub total_size_bytes: u64,
    pub average_item_size_bytes: u64,
    pub adapter_type: String,
}

/// Port for pluggable item storage.
#[async_trait]
pub trait BaseStorage<T: Send + Sync + 'static>: Send + Sync {
    /// Prepare the adapter (open connections, create tables).
    async fn initialize(&self) -> RuntimeResult<()>;

    /// Persist an item, replacing any existing item with the same id.
    async fn store(&self, item: StoredItem<T>) -> RuntimeResult<()>;

    /// Fetch an item by id. Expired items are purged and not returned.
    async fn retrieve(&self, id: &str) -> RuntimeResult<Option<StoredItem<T>>>;

    /// Delete an item; returns whether it existed.
    async fn delete(&self, id: &str) -> RuntimeResult<bool>;

    /// Remove all items.
    async fn clear(&self) -> RuntimeResult<()>;

    /// Adapter statistics.
    async fn get_stats(&self) -> RuntimeResult<StorageStats>;

    /// Liveness probe.
    async fn is_healthy(&self) -> bool;

    /// Eagerly purge expired items; returns the purge count.
    async fn cleanup(&self) -> RuntimeResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_check() {
        let now = Utc::now();
        let item = StoredItem::new("a", 1u32);
        assert!(!item.is_expired(now));

        let expired = StoredItem::new("b", 1u32).with_expiry(now - Duration::seconds(1));
        assert!(expired.is_expired(now));

        let future = StoredItem::new("c", 1u32).with_expiry(now + Duration::minutes(5));
        assert!(!future.is_expired(now));
    }
}
