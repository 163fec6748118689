mod settings;

pub use settings::{
    BackpressureConfig, CacheConfig, DeliveryConfig, MemoryPressureThresholds, PerformanceConfig,
    QueueConfig, RejectRates, ServerConfig, Settings, TaskConfig, WorkersConfig,
    WorkspaceCacheConfig,
};
