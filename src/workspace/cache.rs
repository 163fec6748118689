//! TTL + LRU cache of open workspaces.
//!
//! The cache is the sole owner of workspace handle lifecycle: every path
//! that removes an entry (LRU eviction, TTL sweep, explicit remove, final
//! close) closes the workspace's database pools exactly once, because
//! removal from the map transfers ownership of the entry to the remover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use super::Workspace;

struct CacheEntry {
    workspace: Arc<Workspace>,
    created_at: Instant,
    last_access: Instant,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub max_size: usize,
    pub ttl_minutes: u64,
}

pub struct WorkspaceCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_size: usize,
    ttl: Duration,
    sweeper_shutdown: broadcast::Sender<()>,
}

impl WorkspaceCache {
    /// Create a cache and start its background sweeper, which closes
    /// entries idle longer than `ttl` every `cleanup_interval`.
    pub fn new(max_size: usize, ttl: Duration, cleanup_interval: Duration) -> Arc<Self> {
        let (sweeper_shutdown, mut shutdown_rx) = broadcast::channel(1);

        let cache = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            max_size,
            ttl,
            sweeper_shutdown,
        });

        let sweeper = cache.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(cleanup_interval);
            timer.tick().await; // skip immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Workspace cache sweeper stopped");
                        break;
                    }
                    _ = timer.tick() => {
                        sweeper.sweep_once().await;
                    }
                }
            }
        });

        cache
    }

    /// Look up a workspace. Expired entries are evicted asynchronously and
    /// reported as a miss; hits refresh `last_access`.
    pub async fn get(self: &Arc<Self>, user_id: &str) -> Option<Arc<Workspace>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(user_id)?;

        if entry.last_access.elapsed() > self.ttl {
            let cache = self.clone();
            let user_id = user_id.to_string();
            tokio::spawn(async move {
                cache.remove(&user_id).await;
            });
            return None;
        }

        entry.last_access = Instant::now();
        Some(entry.workspace.clone())
    }

    /// Install a workspace, evicting the least recently used entry when the
    /// cache is at capacity. The evicted workspace is closed before the new
    /// entry becomes visible.
    pub async fn put(&self, user_id: &str, workspace: Arc<Workspace>) {
        let mut entries = self.entries.lock().await;

        if entries.len() >= self.max_size {
            if let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                if let Some(evicted) = entries.remove(&lru_key) {
                    tracing::debug!(user_id = %lru_key, "Evicting least recently used workspace");
                    evicted.workspace.close().await;
                }
            }
        }

        let now = Instant::now();
        entries.insert(
            user_id.to_string(),
            CacheEntry {
                workspace,
                created_at: now,
                last_access: now,
            },
        );
    }

    /// Remove a workspace, closing its database pools.
    pub async fn remove(&self, user_id: &str) {
        let removed = {
            let mut entries = self.entries.lock().await;
            entries.remove(user_id)
        };
        if let Some(entry) = removed {
            entry.workspace.close().await;
        }
    }

    /// Close every entry idle longer than the TTL.
    pub async fn sweep_once(&self) {
        let expired: Vec<(String, CacheEntry)> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.last_access.elapsed() > self.ttl)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        if expired.is_empty() {
            return;
        }

        let count = expired.len();
        for (user_id, entry) in expired {
            tracing::debug!(user_id = %user_id, "Closing expired workspace");
            entry.workspace.close().await;
        }
        tracing::info!(removed = count, "Swept expired workspaces");
    }

    /// Stop the sweeper and close every remaining workspace.
    pub async fn close(&self) {
        let _ = self.sweeper_shutdown.send(());

        let drained: Vec<CacheEntry> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, e)| e).collect()
        };
        for entry in drained {
            entry.workspace.close().await;
        }
        tracing::info!("Workspace cache closed");
    }

    pub async fn size(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Users whose workspaces are cached and not yet expired.
    pub async fn list_active_users(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|(_, e)| e.last_access.elapsed() <= self.ttl)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().await;
        let expired = entries
            .values()
            .filter(|e| e.last_access.elapsed() > self.ttl)
            .count();
        CacheStats {
            total_entries: entries.len(),
            expired_entries: expired,
            max_size: self.max_size,
            ttl_minutes: self.ttl.as_secs() / 60,
        }
    }

    /// Age of an entry since creation, for diagnostics.
    pub async fn entry_age(&self, user_id: &str) -> Option<Duration> {
        let entries = self.entries.lock().await;
        entries.get(user_id).map(|e| e.created_at.elapsed())
    }
}
