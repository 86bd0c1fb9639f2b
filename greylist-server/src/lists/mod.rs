//! Timestamped key stores backing the white and grey lists.
//!
//! Each list is its own [`ListStore`] with its own lock, so a lookup in one
//! list never waits on another. Keys are opaque to the store; the helpers in
//! [`keys`] build them.

use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

pub mod sweeper;

/// A mapping from key to the Unix time the key was last seen.
#[async_trait]
pub trait ListStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<i64>;
    /// Inserts or overwrites the timestamp of `key`.
    async fn set(&self, key: &str, seen_at: i64);
    #[allow(dead_code)]
    async fn delete(&self, key: &str) -> bool;
    /// Snapshot of every entry, taken under a single short lock.
    async fn entries(&self) -> Vec<(String, i64)>;
    /// Removes `key` only if it is still expired at `now`. The timestamp is
    /// re-read under the lock, so an entry refreshed since the snapshot
    /// survives.
    async fn remove_stale(&self, key: &str, now: i64, ttl: i64) -> bool;
    async fn len(&self) -> usize;
}

/// An entry is expired once its age reaches the list's TTL.
pub fn is_expired(seen_at: i64, now: i64, ttl: i64) -> bool {
    now - seen_at >= ttl
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<i64> {
        self.entries.lock().await.get(key).copied()
    }

    async fn set(&self, key: &str, seen_at: i64) {
        self.entries.lock().await.insert(key.to_string(), seen_at);
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    async fn entries(&self) -> Vec<(String, i64)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(key, seen_at)| (key.clone(), *seen_at))
            .collect()
    }

    async fn remove_stale(&self, key: &str, now: i64, ttl: i64) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(&seen_at) if is_expired(seen_at, now, ttl) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// The four lists consulted by the engine.
#[derive(Clone)]
pub struct Lists {
    /// `ip=<address>`
    pub whitelist_ip: Arc<dyn ListStore>,
    /// `domain=<domain>`
    pub whitelist_domain: Arc<dyn ListStore>,
    /// `ip=<address>:<sender>:<recipient>`
    pub greylist_ip: Arc<dyn ListStore>,
    /// `domain=<domain>:<sender>:<recipient>`
    pub greylist_domain: Arc<dyn ListStore>,
}

impl Lists {
    pub fn in_memory() -> Self {
        Lists {
            whitelist_ip: Arc::new(MemoryStore::new()),
            whitelist_domain: Arc::new(MemoryStore::new()),
            greylist_ip: Arc::new(MemoryStore::new()),
            greylist_domain: Arc::new(MemoryStore::new()),
        }
    }
}

pub mod keys {
    use std::net::IpAddr;

    pub fn ip(ip: IpAddr) -> String {
        format!("ip={ip}")
    }

    pub fn domain(domain: &str) -> String {
        format!("domain={domain}")
    }

    pub fn ip_triple(ip: IpAddr, sender: &str, recipient: &str) -> String {
        format!("ip={ip}:{sender}:{recipient}")
    }

    pub fn domain_triple(domain: &str, sender: &str, recipient: &str) -> String {
        format!("domain={domain}:{sender}:{recipient}")
    }
}
