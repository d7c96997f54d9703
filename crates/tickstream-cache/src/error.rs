//! Snapshot build errors.

/// Errors that can occur while building a snapshot.
///
/// None of these touch the published cache: a failed build leaves the
/// previous snapshot in place and bumps the error counter.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// JSON serialization of the state failed.
    #[error("snapshot serialization failed: {source}")]
    Serialize {
        /// The underlying serde error.
        #[from]
        source: serde_json::Error,
    },

    /// The zstd stream encoder failed.
    #[error("snapshot compression failed: {source}")]
    Compress {
        /// The underlying I/O error reported by the encoder.
        source: std::io::Error,
    },

    /// The serialized frame was not valid UTF-8.
    #[error("snapshot frame is not valid UTF-8")]
    Utf8,

    /// The blocking compression task panicked or was cancelled.
    #[error("compression task failed: {0}")]
    Task(String),

    /// The builder was stopped between two chunks.
    #[error("snapshot build cancelled")]
    Cancelled,
}

impl BuildError {
    /// Whether this error counts as a build failure.
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}
