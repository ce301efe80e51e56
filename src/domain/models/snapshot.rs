//! Content-addressed kernel snapshots.
//!
//! A snapshot freezes `(events, state)` under a deterministic hash so that
//! pause/resume and idempotent persistence work across processes. Hashing
//! canonicalizes JSON (recursively sorted object keys, no whitespace)
//! before SHA-256, and the hex digest is pinned behind a version header so
//! a future canonicalization can migrate without colliding.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::event::Event;

/// Current hash format version header.
pub const HASH_FORMAT_VERSION: &str = "v1";

/// A frozen copy of kernel state plus the events captured with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Execution-context id (`tenant_id:job_id`).
    pub xc_id: String,
    /// Epoch milliseconds at capture.
    pub ts: i64,
    /// Serialized kernel state.
    pub state: Value,
    /// Events captured alongside the state.
    pub events: Vec<Event>,
    /// `v1:<hex sha-256>` over canonical `(events, state)`.
    pub hash: String,
}

impl Snapshot {
    /// Capture a snapshot, computing the content hash.
    pub fn capture(xc_id: impl Into<String>, state: Value, events: Vec<Event>) -> RuntimeResult<Self> {
        let hash = stable_hash(&events, &state)?;
        Ok(Self {
            xc_id: xc_id.into(),
            ts: Utc::now().timestamp_millis(),
            state,
            events,
            hash,
        })
    }

    /// Recompute the hash and compare against the stored one.
    pub fn verify(&self) -> RuntimeResult<bool> {
        Ok(stable_hash(&self.events, &self.state)? == self.hash)
    }
}

/// Deterministic content hash of `(events, state)`.
///
/// Identical inputs yield identical output across processes and runs.
pub fn stable_hash(events: &[Event], state: &Value) -> RuntimeResult<String> {
    let events_value = serde_json::to_value(events)?;
    let mut body = String::with_capacity(256);
    canonicalize(&events_value, &mut body);
    body.push(',');
    canonicalize(state, &mut body);

    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    Ok(format!("{HASH_FORMAT_VERSION}:{}", hex::encode(hasher.finalize())))
}

/// Serialize a JSON value with recursively sorted object keys and no
/// whitespace.
fn canonicalize(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Object keys are strings; string serialization is infallible.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                canonicalize(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonicalize(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Seam for optional delta compression of snapshot bodies.
pub trait DeltaCodec: Send + Sync {
    /// Compress a serialized snapshot body.
    fn encode(&self, body: &[u8]) -> RuntimeResult<Vec<u8>>;
    /// Decompress a previously encoded body.
    fn decode(&self, body: &[u8]) -> RuntimeResult<Vec<u8>>;
    /// Codec name recorded next to stored snapshots.
    fn name(&self) -> &'static str;
}

/// zstd-backed default codec.
#[derive(Debug, Default)]
pub struct ZstdDeltaCodec {
    level: i32,
}

impl ZstdDeltaCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl DeltaCodec for ZstdDeltaCodec {
    fn encode(&self, body: &[u8]) -> RuntimeResult<Vec<u8>> {
        let level = if self.level == 0 { 3 } else { self.level };
        zstd::encode_all(body, level).map_err(|e| RuntimeError::Storage(e.to_string()))
    }

    fn decode(&self, body: &[u8]) -> RuntimeResult<Vec<u8>> {
        zstd::decode_all(body).map_err(|e| RuntimeError::Storage(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "zstd"
    }
}
