//! Client-side reconciliation of snapshots and deltas.
//!
//! The [`Reconciler`] is transport-free: feed it server frames, send
//! whatever replies it returns. It keeps a pending queue sorted by tick
//! and applies from the head:
//!
//! - a head at or below `local_tick` is stale and discarded;
//! - a snapshot replaces the state wholesale;
//! - a delta is applied only when it is exactly `local_tick + 1`;
//! - any other delta is a gap: draining stops until the missing delta or
//!   a covering snapshot arrives. Deltas are never applied out of order.
//!
//! Every processed message, applied or discarded, costs its weight in
//! credits, matching what the server debited when sending it. When the
//! balance drops below half the window the reconciler asks for a refill
//! up to the full window and counts it as granted.

use std::collections::VecDeque;
use std::io::Read;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tickstream_types::{
    ClientMessage, Credit, DeltaPayload, Hello, LARGE_SNAPSHOT_ENCODING, MAX_WINDOW_REQUEST, Pong,
    ProtocolError, Resume, ServerMessage, Snapshot, SnapshotLarge, StreamState, TickId, Welcome,
};
use tracing::{debug, warn};

use crate::error::ClientError;

/// Upper bound on a decompressed `snapshotLarge` frame.
pub const MAX_DECODED_SNAPSHOT_BYTES: usize = 256 * 1024 * 1024;

/// A state-bearing message waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    Snapshot {
        tick_id: TickId,
        state: StreamState,
        weight: u32,
    },
    Delta {
        tick_id: TickId,
        payload: DeltaPayload,
    },
}

impl Pending {
    const fn tick_id(&self) -> TickId {
        match self {
            Self::Snapshot { tick_id, .. } | Self::Delta { tick_id, .. } => *tick_id,
        }
    }

    const fn weight(&self) -> u32 {
        match self {
            Self::Snapshot { weight, .. } => *weight,
            Self::Delta { .. } => 1,
        }
    }

    const fn is_snapshot(&self) -> bool {
        matches!(self, Self::Snapshot { .. })
    }
}

/// What the caller should do after a frame was handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reaction {
    /// Frames to send back, in order.
    pub replies: Vec<ClientMessage>,
    /// Set when the server said `bye`; the caller should close.
    pub bye: Option<String>,
}

/// Running totals, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    /// Snapshots applied.
    pub snapshots_applied: u64,
    /// Deltas applied.
    pub deltas_applied: u64,
    /// Stale messages discarded.
    pub discarded: u64,
    /// Times draining stopped at a gap.
    pub stalls: u64,
    /// `credit` messages emitted.
    pub credit_requests: u64,
}

/// Client-side stream state plus credit accounting.
#[derive(Debug, Clone)]
pub struct Reconciler {
    stream_id: String,
    want_window: u32,
    state: StreamState,
    local_tick: TickId,
    pending: VecDeque<Pending>,
    welcomed: bool,
    max_window: u32,
    credit_threshold: u32,
    credits: u32,
    paused: bool,
    stats: ReconcilerStats,
}

impl Reconciler {
    /// A reconciler at tick 0 with the empty state.
    pub fn new(stream_id: impl Into<String>, want_window: u32) -> Self {
        let want_window = want_window.clamp(1, MAX_WINDOW_REQUEST);
        Self {
            stream_id: stream_id.into(),
            want_window,
            state: StreamState::default(),
            local_tick: 0,
            pending: VecDeque::new(),
            welcomed: false,
            max_window: want_window,
            credit_threshold: threshold_for(want_window),
            credits: 0,
            paused: false,
            stats: ReconcilerStats::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Highest tick applied.
    pub const fn local_tick(&self) -> TickId {
        self.local_tick
    }

    /// State as of [`local_tick`](Self::local_tick).
    pub const fn state(&self) -> &StreamState {
        &self.state
    }

    /// Current credit balance.
    pub const fn credits(&self) -> u32 {
        self.credits
    }

    /// Negotiated window.
    pub const fn max_window(&self) -> u32 {
        self.max_window
    }

    /// Balance below which a refill is requested.
    pub const fn credit_threshold(&self) -> u32 {
        self.credit_threshold
    }

    /// Messages received but not yet applied.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether draining is suspended.
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Running totals.
    pub const fn stats(&self) -> ReconcilerStats {
        self.stats
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// The `hello` to open (or reopen) a connection with. A client that
    /// has applied something asks to resume after it.
    pub fn hello(&self) -> ClientMessage {
        ClientMessage::Hello(Hello {
            stream_id: self.stream_id.clone(),
            want_window: self.want_window,
            resume: (self.local_tick > 0).then_some(Resume {
                last_applied: self.local_tick,
            }),
        })
    }

    /// Forget everything tied to the dropped connection. Applied state
    /// and `local_tick` survive for the resume.
    pub fn on_disconnect(&mut self) {
        self.pending.clear();
        self.welcomed = false;
        self.credits = 0;
    }

    /// Suspend draining. Messages keep queueing in tick order.
    pub const fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume draining and return any `credit` request that results.
    pub fn resume(&mut self) -> Vec<ClientMessage> {
        self.paused = false;
        self.drain()
    }

    // -----------------------------------------------------------------------
    // Incoming frames
    // -----------------------------------------------------------------------

    /// Handle one server text frame. Unknown message types are skipped.
    pub fn handle_text(&mut self, text: &str) -> Result<Reaction, ClientError> {
        match ServerMessage::parse(text) {
            Ok(msg) => self.handle(msg),
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(kind, "Ignoring unknown server message");
                Ok(Reaction::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handle one decoded server message.
    pub fn handle(&mut self, msg: ServerMessage) -> Result<Reaction, ClientError> {
        let mut reaction = Reaction::default();
        match msg {
            ServerMessage::Welcome(welcome) => {
                self.on_welcome(&welcome);
                reaction.replies = self.drain();
            }
            ServerMessage::Ping(ping) => {
                reaction.replies.push(ClientMessage::Pong(Pong { t: ping.t }));
            }
            ServerMessage::Delta(delta) => {
                self.push(Pending::Delta {
                    tick_id: delta.tick_id,
                    payload: delta.payload,
                });
                reaction.replies = self.drain();
            }
            ServerMessage::Snapshot(snapshot) => {
                self.push(Pending::Snapshot {
                    tick_id: snapshot.tick_id,
                    state: snapshot.state,
                    weight: 1,
                });
                reaction.replies = self.drain();
            }
            ServerMessage::SnapshotLarge(large) => {
                let snapshot = decode_large(&large)?;
                self.push(Pending::Snapshot {
                    tick_id: snapshot.tick_id,
                    state: snapshot.state,
                    weight: large.weight.max(1),
                });
                reaction.replies = self.drain();
            }
            ServerMessage::Bye(bye) => {
                reaction.bye = Some(bye.reason);
            }
        }
        Ok(reaction)
    }

    fn on_welcome(&mut self, welcome: &Welcome) {
        if welcome.stream_id != self.stream_id {
            warn!(
                expected = self.stream_id,
                got = welcome.stream_id,
                "Welcome names a different stream"
            );
        }
        self.welcomed = true;
        self.max_window = welcome.max_window.max(1);
        self.credit_threshold = threshold_for(self.max_window);
        self.credits = self.max_window;
        debug!(
            max_window = self.max_window,
            credit_threshold = self.credit_threshold,
            "Welcome received"
        );
    }

    fn push(&mut self, msg: Pending) {
        let tick = msg.tick_id();
        let at = self.pending.partition_point(|p| p.tick_id() <= tick);
        self.pending.insert(at, msg);
    }

    // -----------------------------------------------------------------------
    // Draining
    // -----------------------------------------------------------------------

    /// Apply what can be applied, then request credit if the balance is
    /// low. Does nothing while paused.
    fn drain(&mut self) -> Vec<ClientMessage> {
        if self.paused {
            return Vec::new();
        }

        while let Some(head) = self.pending.pop_front() {
            let tick = head.tick_id();
            if tick <= self.local_tick {
                self.stats.discarded = self.stats.discarded.saturating_add(1);
                self.consume(head.weight());
                continue;
            }

            match head {
                Pending::Snapshot { state, weight, .. } => {
                    self.state = state;
                    self.local_tick = tick;
                    self.stats.snapshots_applied = self.stats.snapshots_applied.saturating_add(1);
                    self.consume(weight);
                }
                Pending::Delta { payload, .. } if tick == self.local_tick.saturating_add(1) => {
                    self.state.apply_delta(&payload);
                    self.local_tick = tick;
                    self.stats.deltas_applied = self.stats.deltas_applied.saturating_add(1);
                    self.consume(1);
                }
                gap @ Pending::Delta { .. } => {
                    // A later snapshot supersedes everything queued before it.
                    if let Some(at) = self.pending.iter().position(Pending::is_snapshot) {
                        debug!(gap_tick = tick, local_tick = self.local_tick, "Skipping to queued snapshot");
                        self.consume(gap.weight());
                        let skipped_all: Vec<Pending> = self.pending.drain(..at).collect();
                        for skipped in skipped_all {
                            self.stats.discarded = self.stats.discarded.saturating_add(1);
                            self.consume(skipped.weight());
                        }
                        self.stats.discarded = self.stats.discarded.saturating_add(1);
                        continue;
                    }
                    debug!(gap_tick = tick, local_tick = self.local_tick, "Waiting for missing delta");
                    self.stats.stalls = self.stats.stalls.saturating_add(1);
                    self.pending.push_front(gap);
                    break;
                }
            }
        }

        self.request_credit().into_iter().collect()
    }

    const fn consume(&mut self, weight: u32) {
        self.credits = self.credits.saturating_sub(weight);
    }

    fn request_credit(&mut self) -> Option<ClientMessage> {
        if !self.welcomed || self.credits >= self.credit_threshold {
            return None;
        }
        let n = self.max_window.saturating_sub(self.credits);
        if n == 0 {
            return None;
        }
        self.credits = self.credits.saturating_add(n);
        self.stats.credit_requests = self.stats.credit_requests.saturating_add(1);
        Some(ClientMessage::Credit(Credit {
            n,
            last_applied: self.local_tick,
        }))
    }
}

/// `max(1, max_window / 2)`.
const fn threshold_for(max_window: u32) -> u32 {
    let half = max_window / 2;
    if half == 0 { 1 } else { half }
}

/// Unpack a `snapshotLarge` into the `snapshot` it wraps.
pub fn decode_large(large: &SnapshotLarge) -> Result<Snapshot, ClientError> {
    if large.encoding != LARGE_SNAPSHOT_ENCODING {
        return Err(ClientError::Decode(format!(
            "unsupported encoding {}",
            large.encoding
        )));
    }

    let compressed = STANDARD.decode(large.bytes.as_bytes())?;
    if u64::try_from(compressed.len()).ok() != Some(large.size) {
        warn!(
            tick_id = large.tick_id,
            declared = large.size,
            actual = compressed.len(),
            "snapshotLarge size mismatch"
        );
    }

    let limit = u64::try_from(MAX_DECODED_SNAPSHOT_BYTES).unwrap_or(u64::MAX);
    let mut frame = Vec::new();
    zstd::stream::Decoder::new(compressed.as_slice())?
        .take(limit.saturating_add(1))
        .read_to_end(&mut frame)?;
    if frame.len() > MAX_DECODED_SNAPSHOT_BYTES {
        return Err(ClientError::Decode(format!(
            "decompressed snapshot exceeds {MAX_DECODED_SNAPSHOT_BYTES} bytes"
        )));
    }

    let text = std::str::from_utf8(&frame).map_err(|e| ClientError::Decode(e.to_string()))?;
    match ServerMessage::parse(text)? {
        ServerMessage::Snapshot(snapshot) if snapshot.tick_id == large.tick_id => Ok(snapshot),
        ServerMessage::Snapshot(snapshot) => Err(ClientError::Decode(format!(
            "envelope tick {} wraps snapshot tick {}",
            large.tick_id, snapshot.tick_id
        ))),
        other => Err(ClientError::Decode(format!(
            "envelope wraps {:?} instead of a snapshot",
            other.tick_id()
        ))),
    }
}
