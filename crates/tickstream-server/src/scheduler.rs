//! Scheduler pass and ping sweep.
//!
//! Two periodic tasks run over the hub's sessions:
//!
//! - the **pass** (every `pass_interval_ms`) installs snapshots for
//!   deferred sessions, drains each queue under its credit and per-pass
//!   send cap, and collapses queues that grew past `queue_ceiling` into a
//!   single fresh snapshot;
//! - the **ping sweep** (every `ping_interval_ms`) sends `ping{t}` to
//!   every session.
//!
//! A failed send closes that session only.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tickstream_cache::WireSnapshot;
use tickstream_cache::encode::now_ms;
use tickstream_types::{Ping, ServerMessage, SessionId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::hub::{SessionHandle, StreamHub};
use crate::session::Session;

/// Counts from one scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassReport {
    /// Messages handed to connection tasks.
    pub sent: u64,
    /// Queues collapsed to a snapshot.
    pub coalesced: u64,
    /// Deferred sessions that received their snapshot.
    pub installed: u64,
    /// Sessions closed after a send failure.
    pub closed: u64,
}

/// Snapshot shared by every session that needs one in the same pass.
#[derive(Default)]
struct PassSnapshots {
    fresh: Option<WireSnapshot>,
    catch_up: Option<WireSnapshot>,
}

impl PassSnapshots {
    async fn fresh(&mut self, hub: &StreamHub) -> Option<WireSnapshot> {
        if self.fresh.is_none() {
            self.fresh = load(hub.fresh_snapshot().await);
        }
        self.fresh.clone()
    }

    async fn catch_up(&mut self, hub: &StreamHub) -> Option<WireSnapshot> {
        if self.catch_up.is_none() {
            self.catch_up = load(hub.catch_up_snapshot().await);
        }
        self.catch_up.clone()
    }
}

fn load(
    result: Result<Option<WireSnapshot>, tickstream_cache::BuildError>,
) -> Option<WireSnapshot> {
    match result {
        Ok(wire) => wire,
        Err(e) => {
            warn!(error = %e, "Inline snapshot failed");
            None
        }
    }
}

/// Run one pass over every session.
pub async fn run_pass(hub: &StreamHub) -> PassReport {
    let ceiling = hub.scheduler_config().queue_ceiling;
    let mut report = PassReport::default();
    let mut snapshots = PassSnapshots::default();

    for (id, handle) in hub.sessions() {
        let (active, deferred) = {
            let session = lock(&handle);
            (session.is_active(), session.needs_snapshot())
        };
        if !active {
            continue;
        }

        // --- Deferred sessions get their snapshot ---
        if deferred {
            if hub.head() == 0 {
                hub.release_deferred(&handle);
            } else if let Some(wire) = snapshots.catch_up(hub).await {
                hub.install_snapshot(&handle, &wire);
                report.installed = report.installed.saturating_add(1);
                debug!(session_id = %id, tick = wire.tick_id, "Deferred snapshot installed");
            }
        }

        // --- Drain under credit and send cap ---
        let (drain, over_ceiling) = {
            let mut session = lock(&handle);
            let drain = session.drain();
            (drain, session.over_ceiling(ceiling))
        };
        report.sent = report.sent.saturating_add(u64::from(drain.sent));
        hub.metrics().add_sent(u64::from(drain.sent));

        if let Some(e) = drain.failed {
            close_failed(hub, id, &handle, &e.to_string());
            report.closed = report.closed.saturating_add(1);
            continue;
        }

        // --- Coalesce overloaded queues ---
        if over_ceiling {
            if let Some(wire) = snapshots.fresh(hub).await {
                let dropped = queue_len(&handle);
                hub.install_snapshot(&handle, &wire);
                hub.metrics().inc_coalesce();
                report.coalesced = report.coalesced.saturating_add(1);
                info!(
                    session_id = %id,
                    dropped,
                    tick = wire.tick_id,
                    "Queue over ceiling, coalesced to snapshot"
                );
            }
        }
    }

    report
}

/// Send `ping{t}` to every session. Returns the number of sessions
/// pinged successfully.
pub fn ping_sweep(hub: &StreamHub) -> usize {
    let frame = match ServerMessage::Ping(Ping { t: now_ms() }).to_json() {
        Ok(json) => Arc::<str>::from(json),
        Err(e) => {
            warn!(error = %e, "Failed to encode ping");
            return 0;
        }
    };

    let mut pinged: usize = 0;
    for (id, handle) in hub.sessions() {
        let result = lock(&handle).send_now(Arc::clone(&frame));
        match result {
            Ok(()) => pinged = pinged.saturating_add(1),
            Err(e) => close_failed(hub, id, &handle, &e.to_string()),
        }
    }
    pinged
}

fn close_failed(hub: &StreamHub, id: SessionId, handle: &SessionHandle, error: &str) {
    hub.metrics().inc_send_failure();
    let role = lock(handle).role().to_owned();
    warn!(session_id = %id, role, error, "Send failed, closing session");
    hub.detach(id, Some("send failed"));
}

fn queue_len(handle: &SessionHandle) -> usize {
    lock(handle).queue_len()
}

fn lock(handle: &Mutex<Session>) -> MutexGuard<'_, Session> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Running scheduler tasks.
#[derive(Debug)]
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    pass: JoinHandle<()>,
    ping: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop both tasks and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for (name, task) in [("pass", self.pass), ("ping", self.ping)] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Scheduler task failed");
            }
        }
        info!("Scheduler stopped");
    }
}

/// Spawn the pass and ping tasks.
pub fn spawn_scheduler(hub: Arc<StreamHub>) -> SchedulerHandle {
    let (stop, stop_rx) = watch::channel(false);
    let config = hub.scheduler_config().clone();
    let pass_interval = config.pass_interval();
    let ping_interval = config.ping_interval();

    let pass = {
        let hub = Arc::clone(&hub);
        let mut stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pass_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        run_pass(&hub).await;
                    }
                }
            }
        })
    };

    let ping = {
        let mut stop_rx = stop_rx;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nobody needs a ping yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let pinged = ping_sweep(&hub);
                        debug!(pinged, "Ping sweep");
                    }
                }
            }
        })
    };

    info!(
        pass_interval_ms = config.pass_interval_ms,
        ping_interval_ms = config.ping_interval_ms,
        "Scheduler started"
    );
    SchedulerHandle { stop, pass, ping }
}
