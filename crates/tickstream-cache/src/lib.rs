//! Snapshot builder and cache for the Tickstream server.
//!
//! Builds compressed full-state snapshots off the tick path at a bounded
//! cadence and publishes them through one atomically swapped pointer.
//!
//! # Modules
//!
//! - [`builder`] -- [`SnapshotCache`]: timer, single-flight builds, views
//!   and stats.
//! - [`encode`] -- Chunked frame serialization, zstd compression, and the
//!   `snapshot` / `snapshotLarge` wire forms.
//! - [`error`] -- [`BuildError`].
//!
//! [`SnapshotCache`]: builder::SnapshotCache
//! [`BuildError`]: error::BuildError

pub mod builder;
pub mod encode;
pub mod error;

pub use builder::{BuildOutcome, CacheStats, CachedSnapshot, SnapshotCache, SnapshotView};
pub use encode::{Compressor, WireSnapshot};
pub use error::BuildError;
