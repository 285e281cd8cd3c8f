use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use eventdesk::auth::session;
use eventdesk::config::{Cli, Config};
use eventdesk::state::AppState;
use eventdesk::storage::{BlobStore, FsBlobBackend};
use eventdesk::tree::DataTree;
use eventdesk::{db, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli)?;
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {}", data_dir.display());

    let config = Config::load(&cli)?;

    // Ensure uploads directory exists
    let uploads = config.uploads_path();
    std::fs::create_dir_all(&uploads)?;

    // Initialize database
    let pool = db::create_pool(&config.db_path())?;
    db::run_migrations(&pool)?;
    {
        let conn = pool.get()?;
        let purged = session::purge_expired(&conn)?;
        if purged > 0 {
            tracing::info!(purged, "Removed expired sessions");
        }
    }

    if config.auth.admin_emails.is_empty() {
        tracing::warn!("No admin_emails configured; nobody can manage posts or events");
    }

    // Build app state
    let state = AppState {
        tree: DataTree::new(pool.clone()),
        blobs: BlobStore::new(
            Arc::new(FsBlobBackend::new(&uploads)),
            config.storage.max_upload_bytes,
        ),
        db: pool,
        config: config.clone(),
    };

    let app = routes::router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal handler, run until killed
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
