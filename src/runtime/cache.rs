//! Cache Service
//!
//! A process-wide string-keyed store with optional per-entry TTL. Expired
//! entries are swept by a background task; entries registered with an
//! expiry channel get a `CacheExpiryEvent` dispatched to their owning
//! component. Only the in-memory backend lives here.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Event delivered when a TTL entry lapses.
#[derive(Clone, Debug)]
pub struct CacheExpiryEvent {
    pub key: String,
    pub value: Value,
}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
    on_expiry: Option<flume::Sender<CacheExpiryEvent>>,
}

pub struct CacheService {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheService {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut guard = self.sweeper.lock().expect("cache sweeper lock");
        if guard.is_some() {
            return;
        }
        let entries = self.entries.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(250));
            loop {
                ticker.tick().await;
                sweep(&entries);
            }
        }));
        tracing::debug!("cache service started");
    }

    pub fn stop(&self) {
        if let Some(task) = self.sweeper.lock().expect("cache sweeper lock").take() {
            task.abort();
        }
        tracing::debug!("cache service stopped");
    }

    pub fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        on_expiry: Option<flume::Sender<CacheExpiryEvent>>,
    ) {
        let mut entries = self.entries.lock().expect("cache entry lock");
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
                on_expiry,
            },
        );
    }

    /// Read a value; lapsed entries read as absent even before the sweeper
    /// gets to them.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().expect("cache entry lock");
        let entry = entries.get(key)?;
        if let Some(expires_at) = entry.expires_at
            && expires_at <= Instant::now()
        {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().expect("cache entry lock");
        entries.remove(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache entry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sweep(entries: &Mutex<HashMap<String, CacheEntry>>) {
    let now = Instant::now();
    let mut expired = Vec::new();
    {
        let mut entries = entries.lock().expect("cache entry lock");
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(entry) = entries.remove(&key) {
                expired.push((key, entry));
            }
        }
    }

    // Dispatch outside the lock.
    for (key, entry) in expired {
        if let Some(on_expiry) = entry.on_expiry {
            let _ = on_expiry.send(CacheExpiryEvent {
                key,
                value: entry.value,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_remove() {
        let cache = CacheService::new();
        cache.set("k", json!(1), None, None);
        assert_eq!(cache.get("k"), Some(json!(1)));
        assert_eq!(cache.remove("k"), Some(json!(1)));
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn ttl_entry_lapses_and_dispatches() {
        let cache = CacheService::new();
        cache.start();
        let (tx, rx) = flume::unbounded();

        cache.set(
            "short",
            json!("gone"),
            Some(Duration::from_millis(10)),
            Some(tx),
        );

        let event = rx.recv_async().await.unwrap();
        assert_eq!(event.key, "short");
        assert_eq!(event.value, json!("gone"));
        assert_eq!(cache.get("short"), None);
        cache.stop();
    }

    #[tokio::test]
    async fn lapsed_entry_reads_absent_before_sweep() {
        let cache = CacheService::new();
        cache.set("k", json!(1), Some(Duration::from_millis(1)), None);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k"), None);
    }
}
