//! Watcher configuration loaded from environment variables.

use std::time::Duration;

use tickstream_types::MAX_WINDOW_REQUEST;

use crate::error::ClientError;

/// Configuration for `tickstream-watch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Stream endpoint, e.g. `ws://127.0.0.1:8080/stream`.
    pub url: String,
    /// Stream to subscribe to.
    pub stream_id: String,
    /// Credit window requested in `hello`.
    pub want_window: u32,
    /// Delay before reconnecting after the connection drops.
    pub reconnect_delay: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            url: String::from("ws://127.0.0.1:8080/stream"),
            stream_id: String::from("tickstream"),
            want_window: 16,
            reconnect_delay: Duration::from_millis(2000),
        }
    }
}

impl WatchConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional variables:
    /// - `TICKSTREAM_URL` -- stream endpoint (default `ws://127.0.0.1:8080/stream`)
    /// - `TICKSTREAM_STREAM_ID` -- stream id (default `tickstream`)
    /// - `TICKSTREAM_WINDOW` -- requested credit window (default 16)
    /// - `TICKSTREAM_RECONNECT_MS` -- reconnect delay in milliseconds (default 2000)
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let defaults = Self::default();

        let url = lookup("TICKSTREAM_URL").unwrap_or(defaults.url);
        let stream_id = lookup("TICKSTREAM_STREAM_ID").unwrap_or(defaults.stream_id);

        let want_window = match lookup("TICKSTREAM_WINDOW") {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|e| ClientError::Config(format!("invalid TICKSTREAM_WINDOW: {e}")))?,
            None => defaults.want_window,
        };
        if want_window == 0 || want_window > MAX_WINDOW_REQUEST {
            return Err(ClientError::Config(format!(
                "TICKSTREAM_WINDOW must be within 1..={MAX_WINDOW_REQUEST}, got {want_window}"
            )));
        }

        let reconnect_delay = match lookup("TICKSTREAM_RECONNECT_MS") {
            Some(raw) => Duration::from_millis(raw.parse::<u64>().map_err(|e| {
                ClientError::Config(format!("invalid TICKSTREAM_RECONNECT_MS: {e}"))
            })?),
            None => defaults.reconnect_delay,
        };

        Ok(Self {
            url,
            stream_id,
            want_window,
            reconnect_delay,
        })
    }
}
