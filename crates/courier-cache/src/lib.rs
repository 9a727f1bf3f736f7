//! Process-local key -> value store with per-entry TTL.
//!
//! TTL is the only eviction rule. An expired entry is treated as absent by
//! `get` (and removed on the spot); a background sweep removes the rest on
//! an interval so abandoned keys don't accumulate.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct CacheInner<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    default_ttl: Duration,
}

/// Cloneable handle to a shared expiring cache.
///
/// Uses `std::sync::RwLock` -- every critical section is a map probe and is
/// never held across an await point.
pub struct ExpiringCache<V> {
    inner: Arc<CacheInner<V>>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl<V> Clone for ExpiringCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            stop_tx: self.stop_tx.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> ExpiringCache<V> {
    /// Create the cache and spawn its sweep task. Must be called from within
    /// a tokio runtime.
    pub fn new(default_ttl: Duration, cleanup_interval: Duration) -> Self {
        let inner = Arc::new(CacheInner {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        });
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let sweep_inner = inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = sweep(&sweep_inner);
                        if removed > 0 {
                            debug!(removed, "cache sweep removed expired entries");
                        }
                    }
                    _ = stop_rx.changed() => return,
                }
            }
        });

        Self {
            inner,
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// Insert with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.inner.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner
            .entries
            .write()
            .expect("cache lock poisoned")
            .insert(key.into(), entry);
    }

    /// Fetch a live entry. An expired entry counts as a miss and is deleted.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.inner.entries.read().expect("cache lock poisoned");
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: upgrade to a write lock and re-check before removing, the
        // key may have been refreshed between the two locks.
        let mut entries = self.inner.entries.write().expect("cache lock poisoned");
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
            entries.remove(key);
        }
        None
    }

    pub fn remove(&self, key: &str) {
        self.inner
            .entries
            .write()
            .expect("cache lock poisoned")
            .remove(key);
    }

    pub fn clear(&self) {
        self.inner
            .entries
            .write()
            .expect("cache lock poisoned")
            .clear();
    }

    /// Terminate the sweep task. The cache itself stays usable; entries keep
    /// expiring lazily on read.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.entries.read().expect("cache lock poisoned").len()
    }
}

fn sweep<V>(inner: &CacheInner<V>) -> usize {
    let now = Instant::now();
    let mut entries = inner.entries.write().expect("cache lock poisoned");
    let before = entries.len();
    entries.retain(|_, entry| entry.expires_at > now);
    before - entries.len()
}
