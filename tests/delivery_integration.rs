//! End-to-end delivery pipeline tests.
//!
//! These drive the full path: submit -> admission -> entry buffer ->
//! priority buckets -> worker inboxes -> per-user SQLite storage -> push
//! broadcaster, plus the retry and shutdown machinery. No network or
//! external services required; workspaces live in a temp directory.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use courier_delivery_service::config::{
    QueueConfig, Settings, TaskConfig, WorkspaceCacheConfig,
};
use courier_delivery_service::delivery::{
    DeliverySystem, DeliveryTask, FixedProbe, MemoryPressure,
};
use courier_delivery_service::error::DeliveryError;
use courier_delivery_service::models::Message;
use courier_delivery_service::push::PushBroadcaster;
use courier_delivery_service::storage::UserStorage;
use courier_delivery_service::workspace::WorkspaceManager;

/// Broadcaster that records every publish for assertions.
struct RecordingBroadcaster {
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingBroadcaster {
    fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
        }
    }

    fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushBroadcaster for RecordingBroadcaster {
    async fn publish(&self, user_id: &str, message: &Message) {
        self.published
            .lock()
            .unwrap()
            .push((user_id.to_string(), message.id.clone()));
    }
}

struct TestEnvironment {
    system: Arc<DeliverySystem>,
    workspaces: Arc<WorkspaceManager>,
    broadcaster: Arc<RecordingBroadcaster>,
    _dir: tempfile::TempDir,
}

fn test_settings(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.server.user_storage = dir.display().to_string();
    settings.delivery.workers.count = 2;
    settings.delivery.queue = QueueConfig {
        entry_size: 256,
        priority_size: 64,
        worker_size: 64,
    };
    settings.delivery.task = TaskConfig {
        timeout_seconds: 30,
        max_retries: 2,
        retry_backoff_base_ms: 20,
        retry_backoff_max_ms: 100,
    };
    settings.cache.workspace = WorkspaceCacheConfig {
        max_size: 16,
        ttl_minutes: 30,
        cleanup_interval_minutes: 5,
    };
    settings
}

async fn create_environment(pressure: MemoryPressure) -> TestEnvironment {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let workspaces = Arc::new(WorkspaceManager::new(
        dir.path(),
        &settings.cache.workspace,
    ));
    let broadcaster = Arc::new(RecordingBroadcaster::new());

    let system = Arc::new(DeliverySystem::with_probe(
        &settings,
        workspaces.clone(),
        broadcaster.clone(),
        Arc::new(FixedProbe(pressure)),
    ));
    system.start().await.unwrap();

    TestEnvironment {
        system,
        workspaces,
        broadcaster,
        _dir: dir,
    }
}

fn test_message(user: &str, priority: i32) -> Message {
    Message::builder(user, "default")
        .title("integration")
        .content("hello")
        .priority(priority)
        .sender("test-suite")
        .build()
}

async fn wait_for<F, Fut>(deadline: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let limit = Instant::now() + deadline;
    loop {
        if condition().await {
            return;
        }
        assert!(Instant::now() < limit, "condition not met within {deadline:?}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_single_recipient_happy_path() {
    let env = create_environment(MemoryPressure::Low).await;

    let msg = test_message("user-1", 5);
    let msg_id = msg.id.clone();
    env.system
        .submit_message(msg, vec!["user-1".to_string()])
        .await
        .unwrap();

    let system = env.system.clone();
    wait_for(Duration::from_secs(5), move || {
        let system = system.clone();
        async move { system.stats().total_delivered == 1 }
    })
    .await;

    // Message landed in user-1's workspace
    let ws = env.workspaces.get_workspace("user-1").await.unwrap();
    let stored = UserStorage::new(ws).get_message(&msg_id).await.unwrap();
    assert_eq!(stored.user_id, "user-1");
    assert_eq!(stored.content, "hello");

    let stats = env.system.stats();
    assert_eq!(stats.total_received, 1);
    assert_eq!(stats.total_delivered, 1);
    assert_eq!(stats.total_failed, 0);

    // Broadcaster saw exactly one publish for that user and message
    let published = env.broadcaster.published();
    assert_eq!(published, vec![("user-1".to_string(), msg_id)]);

    env.system.stop().await.unwrap();
}

#[tokio::test]
async fn test_multi_recipient_fan_out() {
    let env = create_environment(MemoryPressure::Low).await;

    let recipients: Vec<String> = (0..3).map(|i| format!("user-{i}")).collect();
    let msg = test_message("user-0", 5);
    let msg_id = msg.id.clone();
    env.system
        .submit_message(msg, recipients.clone())
        .await
        .unwrap();

    let system = env.system.clone();
    wait_for(Duration::from_secs(5), move || {
        let system = system.clone();
        async move { system.stats().total_delivered == 1 }
    })
    .await;

    // Every recipient's workspace holds its own copy
    for user in &recipients {
        let ws = env.workspaces.get_workspace(user).await.unwrap();
        let copy = UserStorage::new(ws).get_message(&msg_id).await.unwrap();
        assert_eq!(&copy.user_id, user);
    }

    // One task, one delivered increment, three publishes
    assert_eq!(env.system.stats().total_delivered, 1);
    assert_eq!(env.broadcaster.published().len(), 3);

    env.system.stop().await.unwrap();
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test]
async fn test_backpressure_under_critical_pressure() {
    let env = create_environment(MemoryPressure::Critical).await;

    // The very first submission seeds the window and is always accepted
    env.system
        .submit_message(test_message("user-1", 9), vec!["user-1".to_string()])
        .await
        .unwrap();

    // Under Critical pressure, priority below 8 is shed
    let err = env
        .system
        .submit_message(test_message("user-1", 5), vec!["user-1".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::RejectedOverload { priority: 5 }));

    // High-priority traffic still gets through
    env.system
        .submit_message(test_message("user-1", 9), vec!["user-1".to_string()])
        .await
        .unwrap();

    let stats = env.system.stats();
    assert_eq!(stats.total_received, 2);

    env.system.stop().await.unwrap();
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn test_retry_exhaustion_marks_task_failed() {
    let env = create_environment(MemoryPressure::Low).await;

    // A task that is already expired at pickup fails every attempt:
    // max_retries = 2, so two retries are scheduled before it is abandoned.
    let mut task = DeliveryTask::from_message(
        test_message("user-1", 5),
        vec!["user-1".to_string()],
    );
    task.timeout = Duration::from_millis(1);
    env.system.submit(task).await.unwrap();

    let system = env.system.clone();
    wait_for(Duration::from_secs(15), move || {
        let system = system.clone();
        async move { system.stats().total_failed == 1 }
    })
    .await;

    let stats = env.system.stats();
    assert_eq!(stats.total_retried, 2);
    assert_eq!(stats.total_delivered, 0);
    assert_eq!(stats.total_failed, 1);

    env.system.stop().await.unwrap();
}

// =============================================================================
// Workspace cache interplay
// =============================================================================

#[tokio::test]
async fn test_delivery_survives_cache_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.cache.workspace.max_size = 2;

    let workspaces = Arc::new(WorkspaceManager::new(
        dir.path(),
        &settings.cache.workspace,
    ));
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let system = Arc::new(DeliverySystem::with_probe(
        &settings,
        workspaces.clone(),
        broadcaster,
        Arc::new(FixedProbe(MemoryPressure::Low)),
    ));
    system.start().await.unwrap();

    // Deliver to three users through a cache that holds only two
    let mut message_ids = Vec::new();
    for i in 0..3 {
        let user = format!("user-{i}");
        let msg = test_message(&user, 5);
        message_ids.push((user.clone(), msg.id.clone()));
        system.submit_message(msg, vec![user]).await.unwrap();
    }

    let sys = system.clone();
    wait_for(Duration::from_secs(10), move || {
        let sys = sys.clone();
        async move { sys.stats().total_delivered == 3 }
    })
    .await;

    assert!(workspaces.cache_size().await <= 2);

    // Evicted workspaces reopen on access and the rows are durable
    for (user, msg_id) in &message_ids {
        let ws = workspaces.get_workspace(user).await.unwrap();
        let fetched = UserStorage::new(ws).get_message(msg_id).await.unwrap();
        assert_eq!(&fetched.user_id, user);
    }

    system.stop().await.unwrap();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_graceful_shutdown_after_burst() {
    let env = create_environment(MemoryPressure::Low).await;

    for i in 0..100 {
        let msg = test_message("user-1", 1 + (i % 10));
        env.system
            .submit_message(msg, vec!["user-1".to_string()])
            .await
            .unwrap();
    }

    // Every admitted task settles as delivered or failed
    let system = env.system.clone();
    wait_for(Duration::from_secs(20), move || {
        let system = system.clone();
        async move {
            let stats = system.stats();
            stats.total_delivered + stats.total_failed == 100
        }
    })
    .await;

    let started = Instant::now();
    env.system.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(30));

    // The pipeline refuses work once stopped
    let err = env
        .system
        .submit_message(test_message("user-1", 5), vec!["user-1".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::NotRunning));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let env = create_environment(MemoryPressure::Low).await;
    env.system.stop().await.unwrap();
    env.system.stop().await.unwrap();
}

#[tokio::test]
async fn test_priority_does_not_starve_low() {
    let env = create_environment(MemoryPressure::Low).await;

    // A mixed burst: every priority class must eventually complete
    for priority in [9, 2, 5, 10, 1, 7] {
        env.system
            .submit_message(test_message("user-1", priority), vec!["user-1".to_string()])
            .await
            .unwrap();
    }

    let system = env.system.clone();
    wait_for(Duration::from_secs(10), move || {
        let system = system.clone();
        async move { system.stats().total_delivered == 6 }
    })
    .await;

    env.system.stop().await.unwrap();
}
