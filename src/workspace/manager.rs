//! Lazy workspace creation on top of the cache.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::WorkspaceCacheConfig;
use crate::error::StorageError;

use super::{CacheStats, Workspace, WorkspaceCache};

/// Creates workspaces on first access and keeps them in the cache.
pub struct WorkspaceManager {
    base_path: PathBuf,
    cache: Arc<WorkspaceCache>,
    /// Serializes workspace creation so two concurrent misses for the same
    /// user produce exactly one workspace.
    create_lock: Mutex<()>,
}

impl WorkspaceManager {
    pub fn new(base_path: impl Into<PathBuf>, config: &WorkspaceCacheConfig) -> Self {
        Self {
            base_path: base_path.into(),
            cache: WorkspaceCache::new(config.max_size, config.ttl(), config.cleanup_interval()),
            create_lock: Mutex::new(()),
        }
    }

    /// Get or create the workspace for `user_id`.
    ///
    /// Double-checked: fast-path cache lookup, then the creation lock, then
    /// a second lookup before actually opening databases.
    pub async fn get_workspace(&self, user_id: &str) -> Result<Arc<Workspace>, StorageError> {
        if let Some(ws) = self.cache.get(user_id).await {
            return Ok(ws);
        }

        let _guard = self.create_lock.lock().await;

        if let Some(ws) = self.cache.get(user_id).await {
            return Ok(ws);
        }

        let ws = Arc::new(Workspace::open(&self.base_path, user_id).await?);
        tracing::info!(
            user_id = %user_id,
            path = %ws.base_path.display(),
            "Created user workspace"
        );
        self.cache.put(user_id, ws.clone()).await;

        Ok(ws)
    }

    /// Drop a user's workspace from the cache, closing its handles.
    pub async fn remove_workspace(&self, user_id: &str) {
        self.cache.remove(user_id).await;
    }

    /// Users with a live cached workspace.
    pub async fn list_workspaces(&self) -> Vec<String> {
        self.cache.list_active_users().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.size().await
    }

    /// Stop the sweeper and close every cached workspace.
    pub async fn close(&self) {
        self.cache.close().await;
    }
}
