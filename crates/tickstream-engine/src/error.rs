//! Error types for the engine binary.
//!
//! [`EngineError`] is the top-level error type that wraps every failure
//! mode during startup.

/// Top-level error for the engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: tickstream_core::config::ConfigError,
    },

    /// The stream server failed to start.
    #[error("server error: {source}")]
    Server {
        /// The underlying startup error.
        #[from]
        source: tickstream_server::StartupError,
    },

    /// The initial snapshot build failed.
    #[error("snapshot error: {source}")]
    Snapshot {
        /// The underlying build error.
        #[from]
        source: tickstream_cache::BuildError,
    },
}
