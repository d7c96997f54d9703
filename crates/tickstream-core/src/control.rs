//! Runtime control state for the tick driver.
//!
//! Shared between the driver task and whoever operates it (the engine
//! binary's signal handler, tests). All fields are atomics plus a pair of
//! [`Notify`] handles, so the driver never takes a lock on its hot path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::{SourceConfig, tick_interval_for_rate};

/// Why the driver loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverEndReason {
    /// Reached the configured `max_ticks` limit.
    MaxTicksReached,
    /// [`DriverControl::request_stop`] was called.
    StopRequested,
}

/// Shared driver controls.
#[derive(Debug)]
pub struct DriverControl {
    paused: AtomicBool,
    resume_notify: Notify,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    rate_per_sec: AtomicU64,
    max_ticks: u64,
}

impl DriverControl {
    /// Create controls for a driver running at `rate_per_sec`
    /// (`max_ticks` of 0 means unlimited).
    pub fn new(rate_per_sec: u64, max_ticks: u64) -> Self {
        Self {
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            rate_per_sec: AtomicU64::new(rate_per_sec.max(1)),
            max_ticks,
        }
    }

    /// Create controls from the `source` config section.
    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.rate_per_sec, config.max_ticks)
    }

    // -----------------------------------------------------------------------
    // Pause / Resume
    // -----------------------------------------------------------------------

    /// Check whether the driver is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Pause the driver. Ticks stop until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume the driver and wake it.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resume_notify.notify_one();
    }

    /// Wait until the driver is no longer paused or a stop is requested.
    pub async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_stop_requested() {
            tokio::select! {
                () = self.resume_notify.notified() => {}
                () = self.stop_notify.notified() => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Request a clean stop.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
        self.stop_notify.notify_one();
    }

    /// Check whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Resolve once a stop is requested.
    pub async fn stopped(&self) {
        while !self.is_stop_requested() {
            self.stop_notify.notified().await;
        }
    }

    // -----------------------------------------------------------------------
    // Rate
    // -----------------------------------------------------------------------

    /// Current advance rate in ticks per second.
    pub fn rate_per_sec(&self) -> u64 {
        self.rate_per_sec.load(Ordering::Acquire)
    }

    /// Change the advance rate. Returns the previous rate, or `None` if
    /// `rate` is 0.
    pub fn set_rate_per_sec(&self, rate: u64) -> Option<u64> {
        if rate == 0 {
            return None;
        }
        Some(self.rate_per_sec.swap(rate, Ordering::AcqRel))
    }

    /// Period between advances at the current rate.
    pub fn tick_interval(&self) -> Duration {
        tick_interval_for_rate(self.rate_per_sec())
    }

    // -----------------------------------------------------------------------
    // Boundaries
    // -----------------------------------------------------------------------

    /// Configured tick bound (0 = unlimited).
    pub const fn max_ticks(&self) -> u64 {
        self.max_ticks
    }

    /// Whether `current_tick` has reached the configured bound.
    pub const fn tick_limit_reached(&self, current_tick: u64) -> bool {
        self.max_ticks > 0 && current_tick >= self.max_ticks
    }
}
