//! vigil-api server entry point.

use std::sync::Arc;

use tokio::sync::watch;

use vigil_api::directory::HttpDirectory;
use vigil_api::state::{AppConfig, AppState, LogFormat};
use vigil_api::webhook::WebhookHandler;
use vigil_policy::{DirectoryLookup, HandlerRegistry, StaticDirectory, TracingHandler};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    init_tracing(config.log_format);
    tracing::info!(?config, "configuration loaded");

    // Initialize database pool; absent means in-memory only.
    let db_pool = vigil_api::db::init_pool().await.map_err(|e| {
        tracing::error!("Database initialization failed: {e}");
        e
    })?;

    let directory: Arc<dyn DirectoryLookup> = match &config.directory_url {
        Some(url) => {
            tracing::info!(directory_url = %url, "directory client configured");
            Arc::new(HttpDirectory::new(url, config.engine.directory_timeout())?)
        }
        None => {
            tracing::warn!(
                "VIGIL_DIRECTORY_URL not set; every lookup fails closed and only global policies apply"
            );
            Arc::new(StaticDirectory::new())
        }
    };

    let handlers = match &config.webhook_url {
        Some(url) => {
            tracing::info!(webhook_url = %url, "webhook action handler configured");
            HandlerRegistry::with_fallback(Arc::new(WebhookHandler::new(
                url,
                config.engine.execution_horizon(),
            )?))
        }
        None => {
            tracing::warn!("VIGIL_WEBHOOK_URL not set; actions are logged, not delivered");
            HandlerRegistry::with_fallback(Arc::new(TracingHandler))
        }
    };

    let port = config.port;
    let state = AppState::try_with_config(config, directory, db_pool)?;

    // Hydrate in-memory stores from database (if connected).
    state.hydrate_from_db().await.map_err(|e| {
        tracing::error!("Database hydration failed: {e}");
        e
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor = Arc::new(state.engine.executor(handlers)).spawn(shutdown_rx.clone());
    let flusher = spawn_ledger_flush(state.clone(), shutdown_rx);

    let app = vigil_api::app(state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Vigil API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, draining executor");
    let _ = shutdown_tx.send(true);
    if let Err(e) = executor.await {
        tracing::error!("executor task failed: {e}");
    }
    if let Err(e) = flusher.await {
        tracing::error!("ledger flush task failed: {e}");
    }
    if let Err(e) = state.flush_ledger().await {
        tracing::error!("final ledger flush failed: {e}");
    }
    Ok(())
}

/// Periodically persist ledger entries appended by the executor.
fn spawn_ledger_flush(state: AppState, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if state.db_pool.is_none() {
            return;
        }
        let mut interval = tokio::time::interval(state.config.engine.poll_interval());
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match state.flush_ledger().await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!(entries = n, "ledger entries persisted"),
                        Err(e) => tracing::warn!("ledger flush failed: {e}"),
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
