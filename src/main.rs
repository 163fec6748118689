use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courier_delivery_service::config::Settings;
use courier_delivery_service::delivery::DeliverySystem;
use courier_delivery_service::push::LocalBroadcaster;
use courier_delivery_service::workspace::WorkspaceManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    // Ensure the user storage root exists
    std::fs::create_dir_all(&settings.server.user_storage)?;
    tracing::info!(path = %settings.server.user_storage, "User storage directory ready");

    // Wire the core: workspaces, live push, delivery pipeline
    let workspaces = Arc::new(WorkspaceManager::new(
        &settings.server.user_storage,
        &settings.cache.workspace,
    ));
    let broadcaster = Arc::new(LocalBroadcaster::new());
    let delivery = Arc::new(DeliverySystem::new(&settings, workspaces, broadcaster));

    delivery.start().await?;

    // Run until Ctrl+C or SIGTERM
    shutdown_signal().await;

    delivery.stop().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
