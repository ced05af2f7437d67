use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

/// A Redis-like keyed store with per-key TTL and compare-and-swap, shared
/// across every node in the cluster. A single-process deployment uses
/// [`InMemoryLedger`]; a real cluster would point this at Redis behind the
/// same trait.
#[async_trait]
pub trait SharedLedger: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration);
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    /// Swaps `key`'s value to `new` only if its current value equals
    /// `expected` (`None` meaning "key absent or expired"). Returns whether
    /// the swap took effect.
    async fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: Vec<u8>, ttl: Duration) -> bool;
    async fn delete(&self, key: &str);
    async fn scan_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

pub struct InMemoryLedger {
    data: RwLock<HashMap<String, Entry>>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self { data: RwLock::new(HashMap::new()) }
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedLedger for InMemoryLedger {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.data
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at: Instant::now() + ttl });
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let data = self.data.read().await;
        data.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: Vec<u8>, ttl: Duration) -> bool {
        let mut data = self.data.write().await;
        let current = data.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.as_slice())
            } else {
                None
            }
        });

        if current == expected {
            data.insert(key.to_string(), Entry { value: new, expires_at: Instant::now() + ttl });
            true
        } else {
            false
        }
    }

    async fn delete(&self, key: &str) {
        self.data.write().await.remove(key);
    }

    async fn scan_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let now = Instant::now();
        self.data
            .read()
            .await
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && entry.expires_at > now)
            .map(|(k, entry)| (k.clone(), entry.value.clone()))
            .collect()
    }
}
