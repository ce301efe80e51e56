//! Snapshot persistence port.

use async_trait::async_trait;

use crate::domain::errors::RuntimeResult;
use crate::domain::models::snapshot::Snapshot;

/// Per-call options for [`Persistor::append`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendOptions {
    /// Opt this snapshot into delta compression.
    pub use_delta: bool,
}

/// Content-addressed snapshot store.
///
/// The snapshot hash is the canonical key: appending a hash that already
/// exists is a no-op, which makes append idempotent under concurrent
/// writers.
#[async_trait]
pub trait Persistor: Send + Sync {
    /// Append a snapshot; duplicate hashes are silently ignored.
    async fn append(&self, snapshot: &Snapshot, options: AppendOptions) -> RuntimeResult<()>;

    /// Fetch a snapshot by content hash.
    async fn get_by_hash(&self, hash: &str) -> RuntimeResult<Option<Snapshot>>;

    /// Most recent snapshot for an execution context, if any.
    async fn latest_for(&self, xc_id: &str) -> RuntimeResult<Option<Snapshot>>;

    /// Number of stored snapshots.
    async fn count(&self) -> RuntimeResult<u64>;
}
