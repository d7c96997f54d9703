//! Per-connection session state.
//!
//! A [`Session`] is created when a valid `hello` arrives and lives until
//! the socket closes or the scheduler closes it. It owns the credit
//! balance, the outbound queue, and the sending half of the channel the
//! connection task writes to the socket from.
//!
//! Sessions are always accessed through the hub behind one mutex each, so
//! the tick fan-out and the scheduler pass never mutate a session at the
//! same time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tickstream_types::{SessionId, TickId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;

/// Lifecycle of a stream connection.
///
/// The connection task starts in `Connecting`. A [`Session`] only exists
/// once `hello` is accepted, so it starts `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Socket open, no `hello` yet.
    Connecting,
    /// Handshake done; messages flow.
    Active,
    /// Terminal. Nothing more is sent.
    Closed,
}

/// Kind of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Incremental `delta`.
    Delta,
    /// Full `snapshot` or `snapshotLarge`.
    Snapshot,
}

/// A message waiting for credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Delta or snapshot.
    pub kind: MessageKind,
    /// Tick the message carries.
    pub tick_id: TickId,
    /// Encoded text frame, shared between sessions.
    pub frame: Arc<str>,
    /// Credit cost, at least 1.
    pub weight: u32,
}

impl OutboundMessage {
    /// A delta frame, weight 1.
    pub const fn delta(tick_id: TickId, frame: Arc<str>) -> Self {
        Self {
            kind: MessageKind::Delta,
            tick_id,
            frame,
            weight: 1,
        }
    }

    /// A snapshot frame with an explicit weight.
    pub fn snapshot(tick_id: TickId, frame: Arc<str>, weight: u32) -> Self {
        Self {
            kind: MessageKind::Snapshot,
            tick_id,
            frame,
            weight: weight.max(1),
        }
    }
}

/// Item handed from the scheduler to the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write this text frame.
    Text(Arc<str>),
    /// Send `bye` with this reason and close the socket.
    Close(String),
}

/// Result of draining one session in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Messages handed to the connection task.
    pub sent: u32,
    /// Set when a send failed; the session must be closed.
    pub failed: Option<SendError>,
}

/// State of one subscriber.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    role: String,
    send_cap: u32,
    phase: SessionPhase,
    credits: u32,
    max_window: u32,
    queue: VecDeque<OutboundMessage>,
    last_applied: TickId,
    needs_snapshot: bool,
    last_pong_at: Option<Instant>,
    rtt_ms: Option<u64>,
    outbound: mpsc::Sender<Outbound>,
}

impl Session {
    /// Create an active session with `credits = max_window`.
    pub fn new(
        role: impl Into<String>,
        send_cap: u32,
        max_window: u32,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        let max_window = max_window.max(1);
        Self {
            id: SessionId::new(),
            role: role.into(),
            send_cap: send_cap.max(1),
            phase: SessionPhase::Active,
            credits: max_window,
            max_window,
            queue: VecDeque::new(),
            last_applied: 0,
            needs_snapshot: false,
            last_pong_at: None,
            rtt_ms: None,
            outbound,
        }
    }

    /// Negotiated window: `min(requested, server_cap)`, at least 1.
    pub fn negotiate_window(requested: u32, server_cap: u32) -> u32 {
        requested.min(server_cap).max(1)
    }

    /// Session identifier.
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Role that picked the send cap.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Current phase.
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether the session still receives messages.
    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    /// Current credit balance.
    pub const fn credits(&self) -> u32 {
        self.credits
    }

    /// Negotiated window.
    pub const fn max_window(&self) -> u32 {
        self.max_window
    }

    /// Highest tick the client reported as applied.
    pub const fn last_applied(&self) -> TickId {
        self.last_applied
    }

    /// Number of queued messages.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queued messages, front first.
    pub fn queued(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.queue.iter()
    }

    /// Whether the session waits for a snapshot before receiving deltas.
    pub const fn needs_snapshot(&self) -> bool {
        self.needs_snapshot
    }

    /// Mark the session as waiting for a snapshot.
    pub const fn set_needs_snapshot(&mut self, needs: bool) {
        self.needs_snapshot = needs;
    }

    /// Last measured round-trip time.
    pub const fn rtt_ms(&self) -> Option<u64> {
        self.rtt_ms
    }

    /// When the last `pong` arrived.
    pub const fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }

    /// Resume reported by the client at handshake.
    pub const fn set_last_applied(&mut self, tick: TickId) {
        self.last_applied = tick;
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    /// Append a message to the queue.
    pub fn enqueue(&mut self, msg: OutboundMessage) {
        if self.is_active() {
            self.queue.push_back(msg);
        }
    }

    /// Replace the whole queue with one snapshot.
    pub fn replace_queue(&mut self, snapshot: OutboundMessage) {
        self.queue.clear();
        self.enqueue(snapshot);
    }

    /// Whether the queue has grown past `ceiling`.
    pub fn over_ceiling(&self, ceiling: usize) -> bool {
        self.queue.len() > ceiling
    }

    // -----------------------------------------------------------------------
    // Credit
    // -----------------------------------------------------------------------

    /// Apply a `credit` request. The balance never exceeds the window.
    pub fn grant(&mut self, n: u32, last_applied: TickId) -> u32 {
        self.credits = self.credits.saturating_add(n).min(self.max_window);
        self.last_applied = last_applied;
        self.credits
    }

    /// Send queued messages while credit remains, at most `send_cap` of
    /// them. Each send debits the message weight.
    pub fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.is_active() {
            return report;
        }

        while report.sent < self.send_cap && self.credits > 0 {
            let Some(msg) = self.queue.pop_front() else {
                break;
            };
            if let Err(e) = self.push(Outbound::Text(Arc::clone(&msg.frame))) {
                report.failed = Some(e);
                break;
            }
            self.credits = self.credits.saturating_sub(msg.weight);
            report.sent = report.sent.saturating_add(1);
        }
        report
    }

    // -----------------------------------------------------------------------
    // Direct sends
    // -----------------------------------------------------------------------

    /// Send a frame outside the credit window (welcome, ping).
    pub fn send_now(&self, frame: Arc<str>) -> Result<(), SendError> {
        if !self.is_active() {
            return Err(SendError::Closed);
        }
        self.push(Outbound::Text(frame))
    }

    fn push(&self, item: Outbound) -> Result<(), SendError> {
        self.outbound.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Record a `pong` echoing `sent_at_ms`.
    pub fn record_pong(&mut self, sent_at_ms: i64, now_ms: i64) {
        self.last_pong_at = Some(Instant::now());
        self.rtt_ms = u64::try_from(now_ms.saturating_sub(sent_at_ms)).ok();
    }

    /// Close the session: drop the queue and ask the connection task to
    /// say `bye`. Idempotent.
    pub fn close(&mut self, reason: &str) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        self.phase = SessionPhase::Closed;
        self.queue.clear();
        let _ = self.outbound.try_send(Outbound::Close(reason.to_owned()));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session(window: u32, cap: u32, buffer: usize) -> (Session, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Session::new("default", cap, window, tx), rx)
    }

    fn delta(tick: TickId) -> OutboundMessage {
        OutboundMessage::delta(tick, Arc::from(format!("d{tick}")))
    }

    #[test]
    fn window_is_negotiated_down_to_the_cap() {
        assert_eq!(Session::negotiate_window(16, 1000), 16);
        assert_eq!(Session::negotiate_window(5000, 1000), 1000);
        assert_eq!(Session::negotiate_window(0, 1000), 1);
    }

    #[test]
    fn credits_start_at_the_window() {
        let (s, _rx) = session(16, 3, 8);
        assert_eq!(s.credits(), 16);
        assert_eq!(s.max_window(), 16);
        assert!(s.is_active());
        assert_eq!(s.phase(), SessionPhase::Active);
        assert_eq!(s.role(), "default");
    }

    #[test]
    fn grant_never_exceeds_the_window() {
        let (mut s, _rx) = session(16, 3, 8);
        assert_eq!(s.grant(100, 4), 16);
        assert_eq!(s.last_applied(), 4);
    }

    #[test]
    fn drain_respects_send_cap_and_credit() {
        let (mut s, mut rx) = session(2, 3, 16);
        for tick in 1..=5 {
            s.enqueue(delta(tick));
        }

        let report = s.drain();
        assert_eq!(report.sent, 2);
        assert_eq!(s.credits(), 0);
        assert_eq!(s.queue_len(), 3);

        s.grant(10, 2);
        let report = s.drain();
        assert_eq!(report.sent, 2);
        assert_eq!(s.queue_len(), 1);
        assert_eq!(s.credits(), 0);

        let frames: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames.first(), Some(&Outbound::Text(Arc::from("d1"))));
    }

    #[test]
    fn drain_debits_message_weight() {
        let (mut s, _rx) = session(10, 3, 16);
        s.enqueue(OutboundMessage::snapshot(5, Arc::from("big"), 4));
        s.enqueue(delta(6));
        let report = s.drain();
        assert_eq!(report.sent, 2);
        assert_eq!(s.credits(), 5);
    }

    #[test]
    fn full_buffer_is_a_send_failure() {
        let (mut s, _rx) = session(10, 10, 1);
        s.enqueue(delta(1));
        s.enqueue(delta(2));
        let report = s.drain();
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, Some(SendError::Full));
    }

    #[test]
    fn dropped_receiver_is_a_send_failure() {
        let (mut s, rx) = session(10, 10, 4);
        drop(rx);
        s.enqueue(delta(1));
        assert_eq!(s.drain().failed, Some(SendError::Closed));
    }

    #[test]
    fn close_clears_the_queue_and_signals_bye() {
        let (mut s, mut rx) = session(10, 3, 4);
        s.enqueue(delta(1));
        s.close("server closing");
        s.close("again");
        assert_eq!(s.phase(), SessionPhase::Closed);
        assert_eq!(s.queue_len(), 0);
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close(String::from("server closing"))
        );
        assert!(rx.try_recv().is_err());

        s.enqueue(delta(2));
        assert_eq!(s.queue_len(), 0);
        assert_eq!(s.send_now(Arc::from("x")), Err(SendError::Closed));
    }

    #[test]
    fn pong_records_round_trip() {
        let (mut s, _rx) = session(4, 3, 4);
        s.record_pong(1_000, 1_042);
        assert_eq!(s.rtt_ms(), Some(42));
        assert!(s.last_pong_at().is_some());
        s.record_pong(2_000, 1_000);
        assert_eq!(s.rtt_ms(), None);
    }
}
