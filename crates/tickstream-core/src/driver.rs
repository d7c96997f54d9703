//! Tick driver loop.
//!
//! [`run_driver`] advances a [`TickSource`] at the rate held by a
//! [`DriverControl`], honoring pause/resume, runtime rate changes, an
//! optional tick bound, and stop requests. Rate changes take effect on
//! the next sleep.

use tracing::info;

use crate::control::{DriverControl, DriverEndReason};
use crate::source::TickSource;
use tickstream_types::TickId;

/// Outcome of a driver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverReport {
    /// Why the loop returned.
    pub end_reason: DriverEndReason,
    /// Ticks advanced by this run.
    pub total_ticks: u64,
    /// Source head when the loop returned.
    pub final_tick: TickId,
}

/// Run the driver until the tick bound is hit or a stop is requested.
pub async fn run_driver(source: &TickSource, control: &DriverControl) -> DriverReport {
    let mut total_ticks: u64 = 0;

    info!(
        stream_id = source.stream_id(),
        rate_per_sec = control.rate_per_sec(),
        max_ticks = control.max_ticks(),
        "Tick driver starting"
    );

    let end_reason = loop {
        // --- Check pause ---
        if control.is_paused() {
            info!(tick = source.head(), "Tick driver paused");
            control.wait_if_paused().await;
            if !control.is_stop_requested() {
                info!(tick = source.head(), "Tick driver resumed");
            }
        }

        // --- Check stop ---
        if control.is_stop_requested() {
            info!("Driver stop requested");
            break DriverEndReason::StopRequested;
        }

        // --- Check tick limit ---
        if control.tick_limit_reached(source.head()) {
            info!(
                tick = source.head(),
                max_ticks = control.max_ticks(),
                "Tick limit reached"
            );
            break DriverEndReason::MaxTicksReached;
        }

        source.advance();
        total_ticks = total_ticks.saturating_add(1);

        // --- Sleep for tick interval, waking early on stop ---
        tokio::select! {
            () = tokio::time::sleep(control.tick_interval()) => {}
            () = control.stopped() => {}
        }
    };

    let report = DriverReport {
        end_reason,
        total_ticks,
        final_tick: source.head(),
    };
    log_driver_end(&report);
    report
}

/// Log the driver end line.
pub fn log_driver_end(report: &DriverReport) {
    info!(
        reason = ?report.end_reason,
        total_ticks = report.total_ticks,
        final_tick = report.final_tick,
        "Tick driver ended"
    );
}
