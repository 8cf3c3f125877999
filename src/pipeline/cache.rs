//! In-process TTL cache with an explicit janitor lifecycle.
//!
//! Entries expire lazily on read and eagerly when the janitor sweeps. The
//! janitor is a tokio task owned by the cache: [`TtlCache::start`] spawns it,
//! [`TtlCache::stop`] cancels it. A cache that was never started still
//! honors expiry on read.

use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct TtlCache<K, V> {
    entries: DashMap<K, (V, Instant)>,
    ttl: Duration,
    name: &'static str,
    janitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            name,
            janitor: Mutex::new(None),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Some(entry.0.clone()),
            Some(_) => {}
            None => return None,
        }
        self.entries.remove_if(key, |_, (_, expires)| *expires <= Instant::now());
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, (value, Instant::now() + self.ttl));
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, (v, _))| v)
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, (_, expires)| *expires > now);
        before.saturating_sub(self.entries.len())
    }

    /// Spawn the janitor, sweeping every `interval`. Calling `start` on a
    /// running cache is a no-op. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut janitor = self.janitor.lock().unwrap_or_else(|p| p.into_inner());
        if janitor.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let cache = Arc::downgrade(self);
        let name = self.name;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!(cache = name, removed, "expired entries swept");
                        }
                    }
                }
            }
        });
        *janitor = Some((token, handle));
        debug!(cache = name, interval_ms = interval.as_millis() as u64, "cache janitor started");
    }

    /// Cancel the janitor and wait for it to exit.
    pub async fn stop(&self) {
        let running = self.janitor.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((token, handle)) = running {
            token.cancel();
            let _ = handle.await;
            debug!(cache = self.name, "cache janitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.janitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }
}
