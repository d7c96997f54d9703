//! Wire protocol exchanged over the stream connection.
//!
//! Every frame is a JSON text frame carrying a `type` tag. Client frames
//! decode into [`ClientMessage`], server frames into [`ServerMessage`].
//! Decoding is two-step: the tag is checked against the known vocabulary
//! and the body against its schema (`validator` rules on each body
//! struct). Anything that fails either step is a [`ProtocolError`].

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use validator::Validate;

use crate::state::{DeltaPayload, StreamState, TickId};

/// Largest credit window a client may ask for or replenish in one message.
pub const MAX_WINDOW_REQUEST: u32 = 65_536;

/// Encoding tag used by [`SnapshotLarge`] payloads.
pub const LARGE_SNAPSHOT_ENCODING: &str = "zstd+base64";

const CLIENT_TYPES: [&str; 3] = ["hello", "credit", "pong"];
const SERVER_TYPES: [&str; 6] = ["welcome", "delta", "snapshot", "snapshotLarge", "ping", "bye"];

/// Errors raised while decoding or sequencing protocol messages.
///
/// Each variant maps to the `bye` reason sent before the connection is
/// closed; protocol violations are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or does not match the message shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The `type` tag is missing or not part of the vocabulary.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The body decoded but violates its schema constraints.
    #[error("schema violation: {0}")]
    Schema(String),

    /// A message other than `hello` arrived before the handshake.
    #[error("expected hello, got {0}")]
    ExpectedHello(&'static str),

    /// A second `hello` arrived on an already active connection.
    #[error("duplicate hello")]
    DuplicateHello,

    /// The client asked for a stream this server does not carry.
    #[error("unknown stream: {0}")]
    UnknownStream(String),

    /// A binary frame arrived where only text frames are accepted.
    #[error("binary frames are not supported")]
    BinaryFrame,
}

impl ProtocolError {
    /// Reason string carried by the `bye` sent for this violation.
    pub const fn bye_reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::UnknownType(_) | Self::Schema(_) | Self::BinaryFrame => {
                "invalid message"
            }
            Self::ExpectedHello(_) => "expected hello",
            Self::DuplicateHello => "already connected",
            Self::UnknownStream(_) => "unknown stream",
        }
    }
}

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

/// Resume hint sent by a reconnecting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Resume {
    /// Highest tick the client applied before the connection dropped.
    pub last_applied: TickId,
}

/// Handshake opening a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, Validate)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Hello {
    /// Stream the client wants to follow.
    #[validate(length(min = 1, max = 128))]
    pub stream_id: String,
    /// Requested credit window.
    #[validate(range(min = 1, max = 65536))]
    pub want_window: u32,
    /// Present when the client reconnects after applying some ticks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Resume>,
}

/// Credit replenishment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, Validate)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Credit {
    /// Number of credits to add.
    #[validate(range(min = 1, max = 65536))]
    pub n: u32,
    /// Highest tick applied by the client at the time of the request.
    pub last_applied: TickId,
}

/// Liveness reply echoing the ping timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Pong {
    /// Timestamp copied from the matching `ping`, in Unix milliseconds.
    pub t: i64,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub enum ClientMessage {
    /// Session handshake.
    Hello(Hello),
    /// Credit replenishment.
    Credit(Credit),
    /// Liveness reply.
    Pong(Pong),
}

impl ClientMessage {
    /// Decode and validate a client text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        check_tag(text, &CLIENT_TYPES)?;
        let msg: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    /// Run the schema rules of the carried body.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let result = match self {
            Self::Hello(hello) => hello.validate(),
            Self::Credit(credit) => credit.validate(),
            Self::Pong(_) => Ok(()),
        };
        result.map_err(|e| ProtocolError::Schema(e.to_string()))
    }

    /// Wire tag of this message.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Credit(_) => "credit",
            Self::Pong(_) => "pong",
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

/// Handshake acknowledgement carrying the negotiated window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, Validate)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Welcome {
    /// Stream served on this connection.
    pub stream_id: String,
    /// Negotiated credit window, `min(wantWindow, serverCap)`.
    #[validate(range(min = 1))]
    pub max_window: u32,
    /// Optional protocol features enabled by the server.
    #[serde(default)]
    pub features: Vec<String>,
}

/// One tick worth of change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, Validate)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Delta {
    /// Tick produced by this change.
    #[validate(range(min = 1))]
    pub tick_id: TickId,
    /// The change itself.
    pub payload: DeltaPayload,
}

/// Full state as of a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, Validate)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Snapshot {
    /// Tick the state belongs to.
    #[validate(range(min = 1))]
    pub tick_id: TickId,
    /// Build time in Unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    /// The full state.
    pub state: StreamState,
}

/// Full state too large to ship inline; compressed and base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, Validate)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SnapshotLarge {
    /// Tick the state belongs to.
    #[validate(range(min = 1))]
    pub tick_id: TickId,
    /// Always [`LARGE_SNAPSHOT_ENCODING`].
    pub encoding: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// Credit cost of this message.
    #[validate(range(min = 1))]
    pub weight: u32,
    /// Base64 of the compressed `snapshot` frame.
    pub bytes: String,
}

/// Liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Ping {
    /// Send time in Unix milliseconds.
    pub t: i64,
}

/// Connection teardown notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Bye {
    /// Human-readable reason.
    pub reason: String,
}

/// Messages the server may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub enum ServerMessage {
    /// Handshake acknowledgement.
    Welcome(Welcome),
    /// Incremental change.
    Delta(Delta),
    /// Full state.
    Snapshot(Snapshot),
    /// Full state, compressed.
    SnapshotLarge(SnapshotLarge),
    /// Liveness probe.
    Ping(Ping),
    /// Teardown notice.
    Bye(Bye),
}

impl ServerMessage {
    /// Decode and validate a server text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        check_tag(text, &SERVER_TYPES)?;
        let msg: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    /// Run the schema rules of the carried body.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let result = match self {
            Self::Welcome(welcome) => welcome.validate(),
            Self::Delta(delta) => delta.validate(),
            Self::Snapshot(snapshot) => snapshot.validate(),
            Self::SnapshotLarge(large) => large.validate(),
            Self::Ping(_) | Self::Bye(_) => Ok(()),
        };
        result.map_err(|e| ProtocolError::Schema(e.to_string()))
    }

    /// Build a `bye` message.
    pub fn bye(reason: impl Into<String>) -> Self {
        Self::Bye(Bye {
            reason: reason.into(),
        })
    }

    /// Tick carried by state-bearing messages.
    pub const fn tick_id(&self) -> Option<TickId> {
        match self {
            Self::Delta(delta) => Some(delta.tick_id),
            Self::Snapshot(snapshot) => Some(snapshot.tick_id),
            Self::SnapshotLarge(large) => Some(large.tick_id),
            Self::Welcome(_) | Self::Ping(_) | Self::Bye(_) => None,
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Reject frames whose `type` tag is absent or outside `known`.
fn check_tag(text: &str, known: &[&str]) -> Result<(), ProtocolError> {
    #[derive(Deserialize)]
    struct Tag {
        #[serde(rename = "type")]
        kind: Option<String>,
    }

    let tag: Tag =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    match tag.kind {
        Some(kind) if known.contains(&kind.as_str()) => Ok(()),
        Some(kind) => Err(ProtocolError::UnknownType(kind)),
        None => Err(ProtocolError::UnknownType(String::from("<missing>"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_hello_with_resume() {
        let msg = ClientMessage::parse(
            r#"{"type":"hello","streamId":"s","wantWindow":16,"resume":{"lastApplied":4}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Hello(Hello {
                stream_id: String::from("s"),
                want_window: 16,
                resume: Some(Resume { last_applied: 4 }),
            })
        );
        assert_eq!(msg.kind(), "hello");
    }

    #[test]
    fn unknown_client_type_is_rejected() {
        let err = ClientMessage::parse(r#"{"type":"welcome","streamId":"s"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType(String::from("welcome")));
        assert_eq!(err.bye_reason(), "invalid message");
    }

    #[test]
    fn missing_tag_is_rejected() {
        let err = ClientMessage::parse(r#"{"n":3}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(_)));
    }

    #[test]
    fn non_json_is_malformed() {
        let err = ClientMessage::parse("hello there").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn zero_window_violates_schema() {
        let err =
            ClientMessage::parse(r#"{"type":"hello","streamId":"s","wantWindow":0}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Schema(_)));
    }

    #[test]
    fn oversized_credit_violates_schema() {
        let err = ClientMessage::parse(r#"{"type":"credit","n":70000,"lastApplied":1}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Schema(_)));
    }

    #[test]
    fn negative_last_applied_is_malformed() {
        let err =
            ClientMessage::parse(r#"{"type":"credit","n":1,"lastApplied":-1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn snapshot_frame_decodes_with_timestamp() {
        let msg = ServerMessage::parse(
            r#"{"type":"snapshot","tickId":5,"timestamp":1700000000000,"state":{"count":5,"nodes":{},"edges":{}}}"#,
        )
        .unwrap();
        assert_eq!(msg.tick_id(), Some(5));
    }

    #[test]
    fn delta_for_tick_zero_violates_schema() {
        let err = ServerMessage::parse(r#"{"type":"delta","tickId":0,"payload":{"count":0}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Schema(_)));
    }

    #[test]
    fn server_messages_use_camel_case_tags() {
        let json = ServerMessage::SnapshotLarge(SnapshotLarge {
            tick_id: 3,
            encoding: String::from(LARGE_SNAPSHOT_ENCODING),
            size: 10,
            weight: 1,
            bytes: String::new(),
        })
        .to_json()
        .unwrap();
        assert!(json.starts_with(r#"{"type":"snapshotLarge","tickId":3"#));

        let bye = ServerMessage::bye("done").to_json().unwrap();
        assert_eq!(bye, r#"{"type":"bye","reason":"done"}"#);
    }

    #[test]
    fn bye_reasons_follow_violation_kind() {
        assert_eq!(ProtocolError::DuplicateHello.bye_reason(), "already connected");
        assert_eq!(ProtocolError::ExpectedHello("credit").bye_reason(), "expected hello");
        assert_eq!(
            ProtocolError::UnknownStream(String::from("x")).bye_reason(),
            "unknown stream"
        );
    }
}
