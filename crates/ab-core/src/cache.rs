//! In-memory TTL cache for remote API values.
//!
//! Values are stored as serialized JSON and decoded on every hit, so the
//! cache is shape-lossless for whatever type the caller supplies. The whole
//! map sits behind one async mutex and the producer runs while the lock is
//! held: concurrent callers for the same key observe at most one producer
//! execution per TTL window.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unable to serialize value for cache: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unable to decode cached value: {0}")]
    Decode(#[source] serde_json::Error),
}

struct Entry {
    expires_at: Instant,
    value: Vec<u8>,
}

/// Serializing value cache keyed by string, with per-entry expiry.
#[derive(Default)]
pub struct Cache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value at `key`, or run `producer`, store its result
    /// for `ttl`, and return it.
    ///
    /// The producer runs under the cache lock, which is what single-flights
    /// duplicate queries. The returned value always comes from the encoded
    /// bytes, so a round-trip failure surfaces immediately rather than on
    /// the next hit.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return serde_json::from_slice(&entry.value)
                    .map_err(|e| E::from(CacheError::Decode(e)));
            }
            entries.remove(key);
        }

        let value = producer().await?;
        let encoded = serde_json::to_vec(&value).map_err(|e| E::from(CacheError::Encode(e)))?;
        let decoded =
            serde_json::from_slice(&encoded).map_err(|e| E::from(CacheError::Decode(e)))?;
        entries.insert(
            key.to_string(),
            Entry {
                expires_at: now + ttl,
                value: encoded,
            },
        );
        Ok(decoded)
    }

    /// Drop the entry at `key` unconditionally.
    pub async fn delete(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}
