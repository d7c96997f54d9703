//! Session registry, delta history, and tick fan-out.
//!
//! The [`StreamHub`] is registered as a [`TickSource`] listener. On every
//! tick it encodes the delta once, appends it to a bounded history, and
//! enqueues the shared frame on every active session. Sending is left to
//! the scheduler; the tick path never touches a socket.
//!
//! # Locking
//!
//! Locks are always taken in this order: history, session map, one
//! session. The history lock doubles as the fan-out lock: a `hello`
//! handled under it sees a head tick that every later fan-out follows
//! directly, so catch-up messages and live deltas never overlap or leave
//! a gap.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use serde::Serialize;
use tickstream_cache::encode;
use tickstream_cache::{BuildError, SnapshotCache, WireSnapshot};
use tickstream_core::config::{CacheConfig, SchedulerConfig, StreamConfig};
use tickstream_core::source::{ListenerError, TickSource};
use tickstream_types::{
    DeltaPayload, Hello, ListenerId, ProtocolError, ServerMessage, SessionId, TickId, Welcome,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SendError;
use crate::metrics::StreamMetrics;
use crate::resume::{ResumeContext, ResumePlan, ResumePolicy};
use crate::session::{Outbound, OutboundMessage, Session};

/// Shared handle to one session.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Errors that can occur while attaching a session.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// The `hello` itself is unacceptable.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The `welcome` could not be encoded.
    #[error("failed to encode welcome: {0}")]
    Encode(#[from] serde_json::Error),

    /// The `welcome` could not be queued.
    #[error("failed to send welcome: {0}")]
    Send(#[from] SendError),
}

/// A freshly attached session, as seen by its connection task.
#[derive(Debug)]
pub struct Attached {
    /// Identifier of the new session.
    pub session_id: SessionId,
    /// Negotiated window.
    pub max_window: u32,
    /// Plan used to catch the session up.
    pub plan: ResumePlan,
    /// Frames to write to the socket, in order.
    pub outbound: mpsc::Receiver<Outbound>,
}

/// Encoded `delta` frames for the most recent ticks.
#[derive(Debug)]
struct DeltaHistory {
    frames: VecDeque<(TickId, Arc<str>)>,
    capacity: usize,
    head: TickId,
}

impl DeltaHistory {
    fn new(capacity: usize, head: TickId) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            head,
        }
    }

    fn push(&mut self, tick: TickId, frame: Arc<str>) {
        if self.capacity > 0 {
            if self.frames.len() >= self.capacity {
                self.frames.pop_front();
            }
            self.frames.push_back((tick, frame));
        }
        self.head = tick;
    }

    fn oldest(&self) -> Option<TickId> {
        self.frames.front().map(|(tick, _)| *tick)
    }

    fn covers(&self, from: TickId) -> bool {
        from > self.head || self.oldest().is_some_and(|oldest| oldest <= from)
    }

    fn since(&self, from: TickId) -> impl Iterator<Item = OutboundMessage> + '_ {
        self.frames
            .iter()
            .filter(move |(tick, _)| *tick >= from)
            .map(|(tick, frame)| OutboundMessage::delta(*tick, Arc::clone(frame)))
    }
}

/// Borrowing twin of [`ServerMessage::Delta`], so the tick path encodes
/// without cloning the payload.
#[derive(Serialize)]
#[serde(tag = "type", rename = "delta", rename_all = "camelCase")]
struct DeltaFrame<'a> {
    tick_id: TickId,
    payload: &'a DeltaPayload,
}

/// Encode a `delta` frame.
pub fn encode_delta(tick_id: TickId, payload: &DeltaPayload) -> Result<Arc<str>, serde_json::Error> {
    serde_json::to_string(&DeltaFrame { tick_id, payload }).map(Arc::from)
}

/// Session registry plus delta history for one stream.
pub struct StreamHub {
    stream_id: String,
    features: Vec<String>,
    source: Arc<TickSource>,
    cache: Arc<SnapshotCache>,
    cache_config: CacheConfig,
    scheduler: SchedulerConfig,
    policy: Box<dyn ResumePolicy>,
    metrics: Arc<StreamMetrics>,
    history: Mutex<DeltaHistory>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    listener: Mutex<Option<ListenerId>>,
}

impl StreamHub {
    /// Create a hub. The history keeps
    /// `max(replay_window, staleness_limit)` deltas so a usable snapshot
    /// can always be backfilled to the head.
    pub fn new(
        source: Arc<TickSource>,
        cache: Arc<SnapshotCache>,
        config: &StreamConfig,
        policy: Box<dyn ResumePolicy>,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        let capacity = config
            .scheduler
            .replay_window
            .max(usize::try_from(config.cache.staleness_limit).unwrap_or(usize::MAX));
        let head = source.head();
        Self {
            stream_id: config.server.stream_id.clone(),
            features: config.server.features.clone(),
            source,
            cache,
            cache_config: config.cache.clone(),
            scheduler: config.scheduler.clone(),
            policy,
            metrics,
            history: Mutex::new(DeltaHistory::new(capacity, head)),
            sessions: RwLock::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Stream served by this hub.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Scheduler settings.
    pub const fn scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    /// Snapshot cache backing the hub.
    pub const fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Shared counters.
    pub const fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    /// Latest tick fanned out to sessions.
    pub fn head(&self) -> TickId {
        lock(&self.history).head
    }

    // -----------------------------------------------------------------------
    // Tick fan-out
    // -----------------------------------------------------------------------

    /// Register the hub as a listener on its source. Idempotent.
    pub fn attach_to_source(self: &Arc<Self>) -> ListenerId {
        let mut slot = lock(&self.listener);
        if let Some(id) = *slot {
            return id;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.source.subscribe(Arc::new(move |tick: TickId, delta: &DeltaPayload| {
            weak.upgrade().map_or(Ok(()), |hub| hub.on_tick(tick, delta))
        }));
        *slot = Some(id);
        id
    }

    /// Stop receiving ticks.
    pub fn detach_from_source(&self) {
        if let Some(id) = lock(&self.listener).take() {
            self.source.unsubscribe(id);
        }
    }

    /// Record a tick and enqueue its delta on every active session.
    pub fn on_tick(&self, tick: TickId, delta: &DeltaPayload) -> Result<(), ListenerError> {
        let frame = encode_delta(tick, delta).map_err(|e| ListenerError(e.to_string()))?;

        let mut history = lock(&self.history);
        history.push(tick, Arc::clone(&frame));

        let msg = OutboundMessage::delta(tick, frame);
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        for handle in sessions.values() {
            let mut session = lock(handle);
            if session.is_active() && !session.needs_snapshot() {
                session.enqueue(msg.clone());
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Handle a `hello`: negotiate the window, queue `welcome`, pick a
    /// resume plan, and register the session.
    pub fn attach(&self, hello: &Hello, role: &str) -> Result<Attached, AttachError> {
        if hello.stream_id != self.stream_id {
            return Err(ProtocolError::UnknownStream(hello.stream_id.clone()).into());
        }

        let max_window =
            Session::negotiate_window(hello.want_window, self.scheduler.server_window_cap);
        let (tx, rx) = mpsc::channel(self.scheduler.outbound_buffer.max(1));
        let mut session = Session::new(role, self.scheduler.send_cap_for(role), max_window, tx);

        let welcome = ServerMessage::Welcome(Welcome {
            stream_id: self.stream_id.clone(),
            max_window,
            features: self.features.clone(),
        });
        session.send_now(Arc::from(welcome.to_json()?))?;

        let resume = hello.resume.map(|r| r.last_applied);
        if let Some(last_applied) = resume {
            session.set_last_applied(last_applied);
        }
        let session_id = session.id();
        let handle: SessionHandle = Arc::new(Mutex::new(session));

        let plan = {
            let history = lock(&self.history);
            let usable = self.cache.usable();
            let ctx = ResumeContext {
                last_applied: resume,
                head: history.head,
                oldest_retained: history.oldest(),
                replay_window: u64::try_from(self.scheduler.replay_window).unwrap_or(u64::MAX),
                usable_snapshot: usable.as_ref().map(|v| v.snapshot.tick_id),
            };
            let plan = self.policy.plan(&ctx);

            {
                let mut session = lock(&handle);
                match (plan, usable) {
                    (ResumePlan::Replay { from }, _) => {
                        for msg in history.since(from) {
                            session.enqueue(msg);
                        }
                    }
                    (ResumePlan::Snapshot, Some(view)) => {
                        install(&history, &mut session, &view.snapshot.wire);
                    }
                    (ResumePlan::Snapshot | ResumePlan::Defer, _) => {
                        session.set_needs_snapshot(true);
                    }
                }
            }

            self.sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(session_id, Arc::clone(&handle));
            plan
        };

        self.metrics.inc_session_opened();
        info!(
            session_id = %session_id,
            role,
            max_window,
            resume = ?resume,
            plan = ?plan,
            "Session attached"
        );

        Ok(Attached {
            session_id,
            max_window,
            plan,
            outbound: rx,
        })
    }

    /// Remove a session. With a `reason`, the client is told `bye` first.
    pub fn detach(&self, id: SessionId, reason: Option<&str>) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let Some(handle) = removed else {
            return false;
        };
        lock(&handle).close(reason.unwrap_or("closed"));
        debug!(session_id = %id, reason = reason.unwrap_or("disconnect"), "Session detached");
        true
    }

    /// Close every session, telling each client `reason`.
    pub fn close_all(&self, reason: &str) -> usize {
        let drained: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, handle) in &drained {
            lock(handle).close(reason);
        }
        drained.len()
    }

    /// Apply a `credit`. Returns the new balance.
    pub fn grant(&self, id: SessionId, n: u32, last_applied: TickId) -> Option<u32> {
        let handle = self.session(id)?;
        let mut session = lock(&handle);
        let credits = session.grant(n, last_applied);
        debug!(session_id = %id, n, last_applied, credits, "Credit granted");
        Some(credits)
    }

    /// Record a `pong`.
    pub fn record_pong(&self, id: SessionId, sent_at_ms: i64) -> bool {
        let Some(handle) = self.session(id) else {
            return false;
        };
        lock(&handle).record_pong(sent_at_ms, encode::now_ms());
        true
    }

    /// Look up one session.
    pub fn session(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Handles to every registered session.
    pub fn sessions(&self) -> Vec<(SessionId, SessionHandle)> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handle)| (*id, Arc::clone(handle)))
            .collect()
    }

    /// Largest round-trip time across sessions that answered a ping.
    pub fn max_rtt_ms(&self) -> Option<u64> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|handle| lock(handle).rtt_ms())
            .max()
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // -----------------------------------------------------------------------
    // Snapshots for the scheduler
    // -----------------------------------------------------------------------

    /// A snapshot at or after the hub head, so installing it leaves a
    /// single message in the queue. Uses the cache when it is that fresh,
    /// otherwise encodes one from the source on the blocking pool.
    /// `None` before the first tick.
    pub async fn fresh_snapshot(&self) -> Result<Option<WireSnapshot>, BuildError> {
        let head = self.head();
        if head == 0 {
            return Ok(None);
        }
        if let Some(view) = self.cache.usable().filter(|v| v.snapshot.tick_id >= head) {
            return Ok(Some(view.snapshot.wire.clone()));
        }

        let source = Arc::clone(&self.source);
        let config = self.cache_config.clone();
        let wire = tokio::task::spawn_blocking(move || encode::encode_inline(source.snapshot(), &config))
            .await
            .map_err(|e| BuildError::Task(e.to_string()))??;
        Ok(Some(wire))
    }

    /// A snapshot for a deferred session: the cached one if usable (the
    /// history backfills it), otherwise a fresh one.
    pub async fn catch_up_snapshot(&self) -> Result<Option<WireSnapshot>, BuildError> {
        if let Some(view) = self.cache.usable() {
            return Ok(Some(view.snapshot.wire.clone()));
        }
        self.fresh_snapshot().await
    }

    /// Replace a session's queue with `wire` plus the deltas after it.
    pub fn install_snapshot(&self, handle: &SessionHandle, wire: &WireSnapshot) {
        let history = lock(&self.history);
        let mut session = lock(handle);
        if session.is_active() {
            install(&history, &mut session, wire);
        }
    }

    /// Clear the deferred flag on a session at tick 0, whose empty state
    /// already matches the source.
    pub fn release_deferred(&self, handle: &SessionHandle) {
        let history = lock(&self.history);
        let mut session = lock(handle);
        if history.head == 0 {
            session.set_needs_snapshot(false);
        }
    }
}

impl std::fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHub")
            .field("stream_id", &self.stream_id)
            .field("head", &self.head())
            .field("sessions", &self.session_count())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Queue `wire` followed by every retained delta after it.
fn install(history: &DeltaHistory, session: &mut Session, wire: &WireSnapshot) {
    session.replace_queue(OutboundMessage::snapshot(
        wire.tick_id,
        Arc::clone(&wire.frame),
        wire.weight,
    ));
    let from = wire.tick_id.saturating_add(1);
    if !history.covers(from) {
        warn!(
            session_id = %session.id(),
            snapshot_tick = wire.tick_id,
            oldest = ?history.oldest(),
            "History does not reach back to the snapshot; client will stall until the next one"
        );
    }
    for msg in history.since(from) {
        session.enqueue(msg);
    }
    session.set_needs_snapshot(false);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;
    use crate::resume::CheapestResume;
    use crate::session::MessageKind;
    use tickstream_core::synthetic::SyntheticMutator;
    use tickstream_types::Resume;

    struct Fixture {
        source: Arc<TickSource>,
        cache: Arc<SnapshotCache>,
        hub: Arc<StreamHub>,
    }

    fn fixture(config: &StreamConfig) -> Fixture {
        let source = Arc::new(TickSource::new(
            config.server.stream_id.clone(),
            Box::new(SyntheticMutator::new(5, 32)),
        ));
        let cache = Arc::new(SnapshotCache::new(Arc::clone(&source), config.cache.clone()));
        let hub = Arc::new(StreamHub::new(
            Arc::clone(&source),
            Arc::clone(&cache),
            config,
            Box::new(CheapestResume),
            Arc::new(StreamMetrics::default()),
        ));
        hub.attach_to_source();
        Fixture { source, cache, hub }
    }

    fn hello(window: u32, resume: Option<TickId>) -> Hello {
        Hello {
            stream_id: String::from("tickstream"),
            want_window: window,
            resume: resume.map(|last_applied| Resume { last_applied }),
        }
    }

    fn advance(source: &TickSource, n: u64) {
        for _ in 0..n {
            source.advance();
        }
    }

    fn queued(hub: &StreamHub, id: SessionId) -> Vec<(MessageKind, TickId)> {
        let handle = hub.session(id).unwrap();
        let session = handle.lock().unwrap();
        session.queued().map(|m| (m.kind, m.tick_id)).collect()
    }

    #[test]
    fn delta_frame_matches_server_message() {
        let payload = DeltaPayload {
            count: 3,
            ..DeltaPayload::default()
        };
        let frame = encode_delta(3, &payload).unwrap();
        let ServerMessage::Delta(delta) = ServerMessage::parse(&frame).unwrap() else {
            panic!("expected delta");
        };
        assert_eq!(delta.tick_id, 3);
        assert_eq!(delta.payload, payload);
    }

    #[tokio::test]
    async fn welcome_then_cached_snapshot() {
        let f = fixture(&StreamConfig::default());
        advance(&f.source, 5);
        f.cache.build_now().await.unwrap();

        let mut attached = f.hub.attach(&hello(16, None), "default").unwrap();
        assert_eq!(attached.max_window, 16);
        assert_eq!(attached.plan, ResumePlan::Snapshot);

        let Outbound::Text(first) = attached.outbound.try_recv().unwrap() else {
            panic!("expected welcome frame");
        };
        let ServerMessage::Welcome(welcome) = ServerMessage::parse(&first).unwrap() else {
            panic!("expected welcome");
        };
        assert_eq!(welcome.max_window, 16);
        assert_eq!(welcome.stream_id, "tickstream");

        assert_eq!(
            queued(&f.hub, attached.session_id),
            vec![(MessageKind::Snapshot, 5)]
        );
    }

    #[tokio::test]
    async fn snapshot_is_backfilled_to_the_head() {
        let f = fixture(&StreamConfig::default());
        advance(&f.source, 5);
        f.cache.build_now().await.unwrap();
        advance(&f.source, 3);

        let attached = f.hub.attach(&hello(16, None), "default").unwrap();
        assert_eq!(
            queued(&f.hub, attached.session_id),
            vec![
                (MessageKind::Snapshot, 5),
                (MessageKind::Delta, 6),
                (MessageKind::Delta, 7),
                (MessageKind::Delta, 8),
            ]
        );
    }

    #[test]
    fn live_ticks_fan_out_in_order() {
        let f = fixture(&StreamConfig::default());
        let attached = f.hub.attach(&hello(16, None), "default").unwrap();
        advance(&f.source, 3);
        assert_eq!(
            queued(&f.hub, attached.session_id),
            vec![
                (MessageKind::Delta, 1),
                (MessageKind::Delta, 2),
                (MessageKind::Delta, 3),
            ]
        );
    }

    #[test]
    fn resume_within_window_replays_the_missing_ticks() {
        let f = fixture(&StreamConfig::default());
        advance(&f.source, 10);
        let attached = f.hub.attach(&hello(16, Some(7)), "default").unwrap();
        assert_eq!(attached.plan, ResumePlan::Replay { from: 8 });
        let ticks: Vec<TickId> = queued(&f.hub, attached.session_id)
            .into_iter()
            .map(|(_, t)| t)
            .collect();
        assert_eq!(ticks, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn fresh_client_without_cache_waits_for_a_snapshot_at_the_head() {
        let f = fixture(&StreamConfig::default());
        advance(&f.source, 5);

        let attached = f.hub.attach(&hello(16, None), "default").unwrap();
        assert_eq!(attached.plan, ResumePlan::Defer);
        assert!(queued(&f.hub, attached.session_id).is_empty());

        let wire = f.hub.catch_up_snapshot().await.unwrap().unwrap();
        let handle = f.hub.session(attached.session_id).unwrap();
        f.hub.install_snapshot(&handle, &wire);
        assert_eq!(
            queued(&f.hub, attached.session_id),
            vec![(MessageKind::Snapshot, 5)]
        );
    }

    #[test]
    fn nothing_usable_defers_and_withholds_deltas() {
        let mut config = StreamConfig::default();
        config.scheduler.replay_window = 4;
        config.cache.staleness_limit = 2;
        let f = fixture(&config);
        advance(&f.source, 20);

        let attached = f.hub.attach(&hello(16, None), "default").unwrap();
        assert_eq!(attached.plan, ResumePlan::Defer);
        advance(&f.source, 2);

        let handle = f.hub.session(attached.session_id).unwrap();
        let session = handle.lock().unwrap();
        assert!(session.needs_snapshot());
        assert_eq!(session.queue_len(), 0);
    }

    #[test]
    fn unknown_stream_is_rejected() {
        let f = fixture(&StreamConfig::default());
        let mut h = hello(16, None);
        h.stream_id = String::from("other");
        let err = f.hub.attach(&h, "default").unwrap_err();
        assert!(matches!(
            err,
            AttachError::Protocol(ProtocolError::UnknownStream(_))
        ));
        assert_eq!(f.hub.session_count(), 0);
    }

    #[test]
    fn window_is_capped_by_the_server() {
        let mut config = StreamConfig::default();
        config.scheduler.server_window_cap = 8;
        let f = fixture(&config);
        let attached = f.hub.attach(&hello(500, None), "default").unwrap();
        assert_eq!(attached.max_window, 8);
        let handle = f.hub.session(attached.session_id).unwrap();
        assert_eq!(handle.lock().unwrap().credits(), 8);
        assert_eq!(f.hub.grant(attached.session_id, 100, 0), Some(8));
    }

    #[test]
    fn detach_removes_and_says_bye() {
        let f = fixture(&StreamConfig::default());
        let mut attached = f.hub.attach(&hello(4, None), "default").unwrap();
        let _welcome = attached.outbound.try_recv().unwrap();

        assert!(f.hub.detach(attached.session_id, Some("server closing")));
        assert!(!f.hub.detach(attached.session_id, None));
        assert_eq!(f.hub.session_count(), 0);
        assert_eq!(
            attached.outbound.try_recv().unwrap(),
            Outbound::Close(String::from("server closing"))
        );
    }

    #[tokio::test]
    async fn fresh_snapshot_reaches_the_head() {
        let f = fixture(&StreamConfig::default());
        assert!(f.hub.fresh_snapshot().await.unwrap().is_none());

        advance(&f.source, 4);
        f.cache.build_now().await.unwrap();
        advance(&f.source, 2);

        let wire = f.hub.fresh_snapshot().await.unwrap().unwrap();
        assert_eq!(wire.tick_id, 6);
        let msg = ServerMessage::parse(&wire.frame).unwrap();
        assert_eq!(msg.tick_id(), Some(6));
    }
}
