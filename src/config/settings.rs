use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Root directory for per-user workspaces
    #[serde(default = "default_user_storage")]
    pub user_storage: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub task: TaskConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Worker pool size; 0 means one worker per available CPU core
    #[serde(default)]
    pub count: usize,
    #[serde(default = "default_max_workers")]
    pub max_count: usize,
    #[serde(default = "default_min_workers")]
    pub min_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_entry_size")]
    pub entry_size: usize,
    #[serde(default = "default_priority_size")]
    pub priority_size: usize,
    #[serde(default = "default_worker_size")]
    pub worker_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_task_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub workspace: WorkspaceCacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceCacheConfig {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default = "default_cache_ttl_minutes")]
    pub ttl_minutes: u64,
    #[serde(default = "default_cache_cleanup_minutes")]
    pub cleanup_interval_minutes: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PerformanceConfig {
    #[serde(default)]
    pub backpressure: BackpressureConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackpressureConfig {
    #[serde(default)]
    pub memory_pressure_thresholds: MemoryPressureThresholds,
    #[serde(default)]
    pub reject_rates: RejectRates,
}

/// Used/total memory ratios above which each pressure level applies.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MemoryPressureThresholds {
    #[serde(default = "default_threshold_critical")]
    pub critical: f64,
    #[serde(default = "default_threshold_high")]
    pub high: f64,
    #[serde(default = "default_threshold_medium")]
    pub medium: f64,
}

/// Priority cutoffs per pressure band: tasks below the cutoff are shed.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RejectRates {
    #[serde(default = "default_cutoff_critical")]
    pub critical_priority: i32,
    #[serde(default = "default_cutoff_high")]
    pub high_priority: i32,
    #[serde(default = "default_cutoff_medium")]
    pub medium_priority: i32,
}

fn default_user_storage() -> String {
    "./data/user".to_string()
}

fn default_max_workers() -> usize {
    32
}

fn default_min_workers() -> usize {
    2
}

fn default_entry_size() -> usize {
    10_000
}

fn default_priority_size() -> usize {
    3_000
}

fn default_worker_size() -> usize {
    100
}

fn default_task_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_cache_max_size() -> usize {
    1_000
}

fn default_cache_ttl_minutes() -> u64 {
    30
}

fn default_cache_cleanup_minutes() -> u64 {
    5
}

fn default_threshold_critical() -> f64 {
    0.9
}

fn default_threshold_high() -> f64 {
    0.7
}

fn default_threshold_medium() -> f64 {
    0.5
}

fn default_cutoff_critical() -> i32 {
    8
}

fn default_cutoff_high() -> i32 {
    6
}

fn default_cutoff_medium() -> i32 {
    4
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.user_storage", default_user_storage())?
            .set_default("delivery.workers.count", 0)?
            .set_default("delivery.workers.max_count", default_max_workers() as i64)?
            .set_default("delivery.workers.min_count", default_min_workers() as i64)?
            .set_default("delivery.queue.entry_size", default_entry_size() as i64)?
            .set_default("delivery.queue.priority_size", default_priority_size() as i64)?
            .set_default("delivery.queue.worker_size", default_worker_size() as i64)?
            .set_default("delivery.task.timeout_seconds", default_task_timeout() as i64)?
            .set_default("delivery.task.max_retries", default_max_retries() as i64)?
            .set_default(
                "delivery.task.retry_backoff_base_ms",
                default_backoff_base_ms() as i64,
            )?
            .set_default(
                "delivery.task.retry_backoff_max_ms",
                default_backoff_max_ms() as i64,
            )?
            .set_default("cache.workspace.max_size", default_cache_max_size() as i64)?
            .set_default("cache.workspace.ttl_minutes", default_cache_ttl_minutes() as i64)?
            .set_default(
                "cache.workspace.cleanup_interval_minutes",
                default_cache_cleanup_minutes() as i64,
            )?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_USER_STORAGE, DELIVERY_WORKERS_COUNT, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }
}

impl WorkspaceCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes * 60)
    }
}

impl WorkersConfig {
    /// Resolve the configured pool size: 0 means one worker per CPU core,
    /// and the result is clamped to [min_count, max_count].
    pub fn resolve_count(&self) -> usize {
        let requested = if self.count == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(default_min_workers())
        } else {
            self.count
        };
        requested.clamp(self.min_count.max(1), self.max_count.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            user_storage: default_user_storage(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 0,
            max_count: default_max_workers(),
            min_count: default_min_workers(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            entry_size: default_entry_size(),
            priority_size: default_priority_size(),
            worker_size: default_worker_size(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_task_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_base_ms: default_backoff_base_ms(),
            retry_backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for WorkspaceCacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl_minutes: default_cache_ttl_minutes(),
            cleanup_interval_minutes: default_cache_cleanup_minutes(),
        }
    }
}

impl Default for MemoryPressureThresholds {
    fn default() -> Self {
        Self {
            critical: default_threshold_critical(),
            high: default_threshold_high(),
            medium: default_threshold_medium(),
        }
    }
}

impl Default for RejectRates {
    fn default() -> Self {
        Self {
            critical_priority: default_cutoff_critical(),
            high_priority: default_cutoff_high(),
            medium_priority: default_cutoff_medium(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let queue = QueueConfig::default();
        assert_eq!(queue.entry_size, 10_000);
        assert_eq!(queue.priority_size, 3_000);
        assert_eq!(queue.worker_size, 100);

        let task = TaskConfig::default();
        assert_eq!(task.timeout(), Duration::from_secs(30));
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_backoff_base(), Duration::from_millis(100));
        assert_eq!(task.retry_backoff_max(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_cache_durations() {
        let cache = WorkspaceCacheConfig::default();
        assert_eq!(cache.ttl(), Duration::from_secs(30 * 60));
        assert_eq!(cache.cleanup_interval(), Duration::from_secs(5 * 60));
    }

    #[test]
    fn test_worker_count_resolution() {
        let auto = WorkersConfig {
            count: 0,
            max_count: 32,
            min_count: 2,
        };
        let resolved = auto.resolve_count();
        assert!(resolved >= 2 && resolved <= 32);

        let pinned = WorkersConfig {
            count: 4,
            max_count: 32,
            min_count: 2,
        };
        assert_eq!(pinned.resolve_count(), 4);

        let clamped = WorkersConfig {
            count: 100,
            max_count: 8,
            min_count: 2,
        };
        assert_eq!(clamped.resolve_count(), 8);
    }

    #[test]
    fn test_backpressure_defaults() {
        let bp = BackpressureConfig::default();
        assert_eq!(bp.memory_pressure_thresholds.critical, 0.9);
        assert_eq!(bp.memory_pressure_thresholds.high, 0.7);
        assert_eq!(bp.memory_pressure_thresholds.medium, 0.5);
        assert_eq!(bp.reject_rates.critical_priority, 8);
        assert_eq!(bp.reject_rates.high_priority, 6);
        assert_eq!(bp.reject_rates.medium_priority, 4);
    }
}
