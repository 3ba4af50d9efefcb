use std::sync::Arc;

use mimalloc::MiMalloc;
use tracing::{error, info};

use courier::api::ApiServer;
use courier::config::AppConfig;
use courier::database;
use courier::logging::init_logging;
use courier::services::ServiceContainer;
use courier::utils::system_clock;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    let log_dir = config.log_dir.to_string_lossy().into_owned();
    let (logging_config, _log_guard) = init_logging(&log_dir)?;

    let pool =
        database::init_pool_with_size(&config.database.url, config.database.max_connections)
            .await?;
    database::run_migrations(&pool).await?;

    let container = Arc::new(ServiceContainer::new(pool, &config, system_clock())?);
    container.initialize().await?;
    logging_config.start_retention_cleanup(container.cancellation_token());

    let server = ApiServer::with_state(
        config.api.clone(),
        container.app_state().with_logging_config(logging_config),
    );
    let server_token = server.cancel_token();

    tokio::spawn(async move {
        wait_for_signal().await;
        server_token.cancel();
    });

    info!(version = env!("CARGO_PKG_VERSION"), "courier started");
    if let Err(e) = server.run().await {
        error!(error = %e, "API server failed");
    }

    container.shutdown().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            error!("Failed to install signal handlers, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C");
    }
}
