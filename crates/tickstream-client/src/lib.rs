//! Client side of the Tickstream protocol.
//!
//! - [`reconciler`] -- transport-free reordering, application, and
//!   credit accounting of snapshots and deltas
//! - [`connection`] -- reconnecting `WebSocket` loop driving a reconciler
//! - [`config`] -- environment configuration for `tickstream-watch`

pub mod config;
pub mod connection;
pub mod error;
pub mod reconciler;

pub use config::WatchConfig;
pub use connection::{SessionEnd, run, run_session};
pub use error::ClientError;
pub use reconciler::{Reaction, Reconciler, ReconcilerStats};
