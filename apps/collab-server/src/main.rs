//! Collaborative Editing WebSocket Server
//! Real-time multi-user document collaboration

use collab_engine::{AllowAllGate, CollabService, MemoryStore};
use collab_server::{serve, ServerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("collab_server=debug,collab_engine=debug")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let listener = TcpListener::bind(config.bind_addr).await?;

    // Authentication and durable storage live outside this binary
    let service = Arc::new(CollabService::new(
        config.collab,
        Arc::new(AllowAllGate),
        Arc::new(MemoryStore::new()),
    ));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });

    serve(listener, service, shutdown).await
}
