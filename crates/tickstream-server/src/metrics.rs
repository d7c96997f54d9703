//! Process-wide stream counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters exposed on `/metrics`.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    messages_sent: AtomicU64,
    coalesce: AtomicU64,
    protocol_violations: AtomicU64,
    send_failures: AtomicU64,
    sessions_opened: AtomicU64,
}

/// Plain copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Frames handed to connection tasks by the scheduler.
    pub messages_sent: u64,
    /// Queues collapsed to a snapshot.
    pub coalesce: u64,
    /// Connections closed for protocol violations.
    pub protocol_violations: u64,
    /// Sessions closed because a send failed.
    pub send_failures: u64,
    /// Sessions that completed the handshake.
    pub sessions_opened: u64,
}

impl StreamMetrics {
    /// Count `n` sent messages.
    pub fn add_sent(&self, n: u64) {
        self.messages_sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Count one coalesced queue.
    pub fn inc_coalesce(&self) {
        self.coalesce.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one protocol violation.
    pub fn inc_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one send failure.
    pub fn inc_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one completed handshake.
    pub fn inc_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            coalesce: self.coalesce.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
        }
    }
}
