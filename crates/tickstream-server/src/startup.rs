//! Server startup helper.
//!
//! Provides [`spawn_server`] which binds the stream server eagerly and
//! then serves it on a background Tokio task, so the engine binary can
//! run the tick driver concurrently.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::server::{ServerConfig, ServerError, serve};
use crate::state::AppState;

/// Errors that can occur when spawning the stream server.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The server failed to bind or start.
    #[error("server start error: {0}")]
    Server(#[from] ServerError),
}

/// A server running on a background task.
#[derive(Debug)]
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    addr: std::net::SocketAddr,
}

impl ServerHandle {
    /// Address the server is listening on.
    pub const fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Stream server task failed");
        }
    }
}

/// Spawn the stream server on a background Tokio task.
///
/// The listener is bound before this returns, so a port conflict is
/// reported to the caller instead of being logged from the task.
///
/// # Errors
///
/// Returns [`StartupError::Server`] if the address is invalid or cannot
/// be bound.
pub async fn spawn_server(
    config: &ServerConfig,
    state: Arc<AppState>,
) -> Result<ServerHandle, StartupError> {
    let addr = config.addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(format!("bind failed on {addr}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| ServerError::Bind(format!("no local address: {e}")))?;

    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let signal = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(e) = serve(listener, state, signal).await {
            tracing::error!(error = %e, "Stream server exited with error");
        }
    });

    tracing::info!(%addr, "Stream server spawned on background task");

    Ok(ServerHandle {
        shutdown,
        task,
        addr,
    })
}
