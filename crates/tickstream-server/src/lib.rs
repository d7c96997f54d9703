//! Stream server for Tickstream.
//!
//! This crate owns everything between the tick source and the socket:
//!
//! - the [`StreamHub`](hub::StreamHub), a tick listener that encodes each
//!   delta once, keeps a bounded delta history, and fans frames out to
//!   per-session queues;
//! - [`Session`](session::Session) state: credits, queue, negotiated
//!   window, last applied tick, round-trip time;
//! - the [`scheduler`], which drains queues under credit and per-role
//!   send caps, coalesces overgrown queues into a snapshot, and pings;
//! - the [`resume`] policy deciding how a (re)connecting client is
//!   caught up;
//! - the Axum `WebSocket` endpoint plus `/health` and `/metrics`.
//!
//! # Architecture
//!
//! The tick path only enqueues. Socket writes happen in one task per
//! connection, fed by a bounded channel that the scheduler fills. A
//! session whose channel is full is closed; other sessions are
//! unaffected.

pub mod connection;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod metrics;
pub mod resume;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod startup;
pub mod state;

// Re-export primary types for convenience.
pub use hub::{Attached, AttachError, SessionHandle, StreamHub};
pub use metrics::{MetricsSnapshot, StreamMetrics};
pub use resume::{CheapestResume, ResumeContext, ResumePlan, ResumePolicy};
pub use router::build_router;
pub use scheduler::{PassReport, SchedulerHandle, run_pass, spawn_scheduler};
pub use server::{ServerConfig, ServerError, start_server};
pub use startup::{ServerHandle, StartupError, spawn_server};
pub use state::AppState;
