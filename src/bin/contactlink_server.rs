//! contactlink HTTP server
//!
//! Serves `POST /identify` and `GET /health` over the in-memory store, or over
//! a persistent database when `--data-dir` / `CONTACTLINK_DATA_DIR` is set.

use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use contactlink::config::ServerConfig;
use contactlink::storage::persistent::open_database;
use contactlink::transport::{router, AppState};
use contactlink::{ContactStore, IdentityResolver, InMemoryContactStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(config.log_filter()).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let policy = config.request_policy()?;
    let store: Arc<dyn ContactStore> = match &config.data_dir {
        Some(dir) => {
            let store = open_database(dir, Some(config.persistent_config()?))?;
            tracing::info!(data_dir = %dir.display(), contacts = store.len(), "using persistent store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("no data directory configured; contacts are kept in memory only");
            Arc::new(InMemoryContactStore::new())
        }
    };

    let state = AppState::new(IdentityResolver::new(store)).with_policy(policy);
    let app = router(state).layer(TraceLayer::new_for_http());

    tracing::info!(addr = %config.addr, "starting contactlink server");

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        },
        () = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        },
    }
}
