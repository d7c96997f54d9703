//! Shared application state for the stream server.

use std::sync::Arc;
use std::time::Instant;

use crate::hub::StreamHub;

/// State shared by every request handler and connection task.
pub struct AppState {
    /// Session registry and delta history.
    pub hub: Arc<StreamHub>,
    /// When the server state was created.
    pub started_at: Instant,
}

impl AppState {
    /// Wrap a hub.
    pub fn new(hub: Arc<StreamHub>) -> Self {
        Self {
            hub,
            started_at: Instant::now(),
        }
    }

    /// Seconds since the state was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
