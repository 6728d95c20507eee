use backup_orchestrator::config::AppConfig;
use backup_orchestrator::db;
use backup_orchestrator::routes;
use backup_orchestrator::scheduler::BackupScheduler;
use backup_orchestrator::state::AppState;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("Starting backup orchestrator on port {}", config.port);

    std::fs::create_dir_all(&config.data_dir)?;

    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = db::create_pool(&db_path)?;
    db::migrate(&pool)?;

    let state = AppState::new(config.clone(), pool);

    let scheduler = match BackupScheduler::start(state.clone()).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Failed to start backup scheduler: {e:#}");
            None
        }
    };

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);
    tracing::info!("Agent control channel: ws://{}/ws/agent", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {e:#}");
        }
    }
    tracing::info!("Orchestrator stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
