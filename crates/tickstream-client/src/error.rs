//! Error types for the stream client.

use tickstream_types::ProtocolError;

/// Errors that can occur while talking to a stream server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A server frame failed to decode or validate.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A `snapshotLarge` body is not valid base64.
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A `snapshotLarge` body failed to decompress.
    #[error("decompression error: {0}")]
    Decompress(#[from] std::io::Error),

    /// A decoded `snapshotLarge` body is not a usable snapshot.
    #[error("snapshot decode error: {0}")]
    Decode(String),

    /// The transport failed.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Configuration is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// A client frame could not be encoded.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}
