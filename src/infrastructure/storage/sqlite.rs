//! SQLite-backed snapshot persistence.
//!
//! One table per collection, keyed by content hash. Appends use
//! `INSERT OR IGNORE`, so concurrent writers of the same snapshot are
//! harmless.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::snapshot::{DeltaCodec, Snapshot, ZstdDeltaCodec};
use crate::domain::ports::persistor::{AppendOptions, Persistor};

/// SQLite persistor over one snapshots table.
pub struct SqlitePersistor {
    pool: SqlitePool,
    table: String,
    codec: Arc<dyn DeltaCodec>,
}

impl SqlitePersistor {
    /// Open (or create) the database and the collection table.
    pub async fn connect(connection_string: &str, collection: &str) -> RuntimeResult<Self> {
        let table = sanitize_table_name(collection)?;
        let options: SqliteConnectOptions = connection_string
            .parse::<SqliteConnectOptions>()
            .map_err(|e| RuntimeError::Storage(format!("bad connection string: {e}")))?
            .create_if_missing(true);

        // One connection: SQLite serializes writers anyway, and a pool of
        // `:memory:` connections would each see a different database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                hash TEXT PRIMARY KEY,
                xc_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                codec TEXT,
                body BLOB NOT NULL
            )"
        ))
        .execute(&pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_xc ON {table} (xc_id, ts)"
        ))
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            table,
            codec: Arc::new(ZstdDeltaCodec::default()),
        })
    }

    fn decode_row(&self, codec: Option<String>, body: Vec<u8>) -> RuntimeResult<Snapshot> {
        let raw = match codec.as_deref() {
            Some(_) => self.codec.decode(&body)?,
            None => body,
        };
        serde_json::from_slice(&raw).map_err(|e| RuntimeError::Serialization(e.to_string()))
    }
}

/// Table names cannot be bound as parameters; restrict them instead.
fn sanitize_table_name(collection: &str) -> RuntimeResult<String> {
    let ok = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !collection.chars().next().is_some_and(|c| c.is_ascii_digit());
    if ok {
        Ok(collection.to_string())
    } else {
        Err(RuntimeError::Storage(format!(
            "invalid collection name '{collection}'"
        )))
    }
}

#[async_trait]
impl Persistor for SqlitePersistor {
    async fn append(&self, snapshot: &Snapshot, options: AppendOptions) -> RuntimeResult<()> {
        let raw = serde_json::to_vec(snapshot)?;
        let (codec, body) = if options.use_delta {
            (Some(self.codec.name()), self.codec.encode(&raw)?)
        } else {
            (None, raw)
        };

        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (hash, xc_id, ts, codec, body) VALUES (?, ?, ?, ?, ?)",
            self.table
        ))
        .bind(&snapshot.hash)
        .bind(&snapshot.xc_id)
        .bind(snapshot.ts)
        .bind(codec)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_hash(&self, hash: &str) -> RuntimeResult<Option<Snapshot>> {
        let row = sqlx::query(&format!(
            "SELECT codec, body FROM {} WHERE hash = ?",
            self.table
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let codec: Option<String> = row.try_get("codec")?;
                let body: Vec<u8> = row.try_get("body")?;
                Ok(Some(self.decode_row(codec, body)?))
            }
            None => Ok(None),
        }
    }

    async fn latest_for(&self, xc_id: &str) -> RuntimeResult<Option<Snapshot>> {
        let row = sqlx::query(&format!(
            "SELECT codec, body FROM {} WHERE xc_id = ? ORDER BY ts DESC LIMIT 1",
            self.table
        ))
        .bind(xc_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let codec: Option<String> = row.try_get("codec")?;
                let body: Vec<u8> = row.try_get("body")?;
                Ok(Some(self.decode_row(codec, body)?))
            }
            None => Ok(None),
        }
    }

    async fn count(&self) -> RuntimeResult<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn persistor() -> SqlitePersistor {
        SqlitePersistor::connect("sqlite::memory:", "snapshots")
            .await
            .unwrap()
    }

    #[test]
    fn test_table_name_sanitization() {
        assert!(sanitize_table_name("snapshots").is_ok());
        assert!(sanitize_table_name("agent_snapshots_2").is_ok());
        assert!(sanitize_table_name("").is_err());
        assert!(sanitize_table_name("drop table;--").is_err());
        assert!(sanitize_table_name("1starts_with_digit").is_err());
    }

    #[tokio::test]
    async fn test_append_get_round_trip() {
        let persistor = persistor().await;
        let snapshot = Snapshot::capture("t:j", json!({"k": [1, 2, 3]}), vec![]).unwrap();

        persistor
            .append(&snapshot, AppendOptions { use_delta: true })
            .await
            .unwrap();
        let loaded = persistor.get_by_hash(&snapshot.hash).await.unwrap().unwrap();
        assert_eq!(loaded.state, snapshot.state);
        assert!(loaded.verify().unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_append_is_noop() {
        let persistor = persistor().await;
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
    async fn test_missing_hash() {
        let persistor = persistor().await;
        assert!(persistor.get_by_hash("v1:none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_for_orders_by_ts() {
        let persistor = persistor().await;
        let mut a = Snapshot::capture("t:j", json!({"v": 1}), vec![]).unwrap();
        a.ts = 10;
        let mut b = Snapshot::capture("t:j", json!({"v": 2}), vec![]).unwrap();
        b.ts = 20;
        persistor.append(&a, AppendOptions::default()).await.unwrap();
        persistor.append(&b, AppendOptions::default()).await.unwrap();

        let latest = persistor.latest_for("t:j").await.unwrap().unwrap();
        assert_eq!(latest.state["v"], 2);
    }
}
