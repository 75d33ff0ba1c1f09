use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::ServiceError;

/// Key-value store with per-entry expiry.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// `None` for both missing and expired entries.
    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError>;

    /// Overwrites any existing value.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), ServiceError>;
}

/// Cache key for a prompt/model pair. The prompt is hashed byte for byte,
/// without any whitespace or case normalization.
pub fn cache_key(prompt: &str, model: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(prompt.len() as u64).to_le_bytes());
    hasher.update(prompt.as_bytes());
    hasher.update(model.as_bytes());
    format!("generate:{}", hasher.finalize().to_hex())
}

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries and returns how many are left.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.len()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), ServiceError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }
}
