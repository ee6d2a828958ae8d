use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tubeads::api;
use tubeads::config::Config;
use tubeads::engine::AdServer;
use tubeads::storage;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    info!("Loaded configuration");

    info!(
        "Using {:?} storage: {}",
        config.database.backend, config.database.url
    );
    let storage = storage::connect(&config.database).await?;

    info!("Initializing database...");
    storage.init().await?;
    info!("Database initialized successfully");

    let server = Arc::new(AdServer::new(storage, &config.engine));

    let reconciler = Arc::new(server.reconciler());
    let reconciler_handle = reconciler.spawn(config.engine.reconcile_interval());
    info!(
        "Budget reconciler running every {}s",
        config.engine.reconcile_interval_secs
    );

    let router = api::create_router(Arc::clone(&server));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Ad server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    // drain buffered recordings before exit
    reconciler_handle.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}
