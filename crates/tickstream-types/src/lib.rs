//! Shared type definitions for the Tickstream server and clients.
//!
//! This crate is the single source of truth for everything that crosses
//! the wire. Types flow downstream to `TypeScript` via `ts-rs` for browser
//! clients.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for sessions and listeners
//! - [`protocol`] -- Client and server message vocabularies with schema
//!   validation
//! - [`state`] -- Stream state, deltas, and the shared apply rule

pub mod ids;
pub mod protocol;
pub mod state;

pub use ids::{ListenerId, SessionId};
pub use protocol::{
    Bye, ClientMessage, Credit, Delta, Hello, LARGE_SNAPSHOT_ENCODING, MAX_WINDOW_REQUEST, Ping,
    Pong, ProtocolError, Resume, ServerMessage, Snapshot, SnapshotLarge, Welcome,
};
pub use state::{DeltaPayload, Edge, Node, StreamState, TickId};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        // ts-rs writes the bindings to `bindings/` relative to the crate
        // root when `export_all` runs.
        use ts_rs::TS;

        let _ = crate::ids::SessionId::export_all();
        let _ = crate::state::StreamState::export_all();
        let _ = crate::state::DeltaPayload::export_all();
        let _ = crate::protocol::ClientMessage::export_all();
        let _ = crate::protocol::ServerMessage::export_all();
    }
}
