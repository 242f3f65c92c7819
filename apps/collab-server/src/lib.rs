//! Collaborative Editing WebSocket Server
//!
//! Thin transport over [`collab_engine::CollabService`]: JSON text frames in,
//! outcomes and topic events out.

mod config;
mod connection;
pub mod protocol;

pub use config::ServerConfig;

use collab_engine::CollabService;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Accept connections until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    service: Arc<CollabService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!(
        "Collaboration server listening on: {}",
        listener.local_addr()?
    );

    let sweeper = service.spawn_presence_sweeper(shutdown.child_token());

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        info!("New connection from: {}", addr);
        tokio::spawn(connection::handle_connection(
            stream,
            addr,
            service.clone(),
            shutdown.child_token(),
        ));
    }

    let _ = sweeper.await;
    match service.flush_dirty().await {
        Ok(0) => {}
        Ok(flushed) => info!("Flushed {} dirty rows on shutdown", flushed),
        Err(e) => tracing::error!("Dirty rows left unflushed on shutdown: {}", e),
    }
    info!("Collaboration server stopped");
    Ok(())
}
