//! Tick source, driver, and configuration for the Tickstream server.
//!
//! This crate owns the authoritative side of a stream: the monotonically
//! advancing tick counter, the state it describes, and the loop that
//! advances it.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `tickstream-config.yaml` into
//!   strongly-typed structs.
//! - [`control`] -- [`DriverControl`]: pause, resume, rate, and stop.
//! - [`driver`] -- [`run_driver`], the async loop that advances the source.
//! - [`source`] -- [`TickSource`] and the [`StateMutator`] seam.
//! - [`synthetic`] -- Seeded [`SyntheticMutator`] for demos and tests.
//!
//! [`DriverControl`]: control::DriverControl
//! [`run_driver`]: driver::run_driver
//! [`TickSource`]: source::TickSource
//! [`StateMutator`]: source::StateMutator
//! [`SyntheticMutator`]: synthetic::SyntheticMutator

pub mod config;
pub mod control;
pub mod driver;
pub mod source;
pub mod synthetic;
