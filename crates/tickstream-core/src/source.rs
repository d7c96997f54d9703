//! Authoritative tick source.
//!
//! The [`TickSource`] is the single writer of the stream state. Each call
//! to [`TickSource::advance`] increments the tick by exactly one, asks the
//! [`StateMutator`] collaborator for the change, applies it, and notifies
//! every registered listener synchronously with `(tick, delta)`.
//!
//! # Guarantees
//!
//! - Ticks start at 1 and are strictly increasing by 1; listeners observe
//!   them in order because advances are serialized end-to-end.
//! - Advancing never fails. A listener that returns an error or panics is
//!   logged and skipped; the remaining listeners still run.
//! - [`TickSource::snapshot`] is a consistent by-value read and never
//!   observes a half-applied delta.
//!
//! Listeners run on the advancing thread and must not call
//! [`TickSource::advance`] themselves.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tickstream_types::{DeltaPayload, ListenerId, StreamState, TickId};
use tracing::{debug, warn};

/// Error a listener may report for one notification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

/// Callback invoked after every advance.
pub type TickListener = Arc<dyn Fn(TickId, &DeltaPayload) -> Result<(), ListenerError> + Send + Sync>;

/// Collaborator that owns the business meaning of a tick.
///
/// Given the tick about to be produced and the state as of the previous
/// tick, returns the change to apply. The source applies the change; the
/// mutator never writes the state directly.
pub trait StateMutator: Send {
    /// Produce the delta for `tick`.
    fn next_delta(&mut self, tick: TickId, state: &StreamState) -> DeltaPayload;
}

/// Consistent by-value copy of the authoritative state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    /// Tick the state belongs to (0 before the first advance).
    pub tick_id: TickId,
    /// The full state.
    pub state: StreamState,
}

struct SourceInner {
    state: StreamState,
    mutator: Box<dyn StateMutator>,
}

/// Authoritative, monotonically advancing tick counter plus state.
pub struct TickSource {
    stream_id: String,
    head: AtomicU64,
    inner: Mutex<SourceInner>,
    /// Serializes whole advances so listeners see ticks in order.
    advance_gate: Mutex<()>,
    listeners: RwLock<HashMap<ListenerId, TickListener>>,
}

impl TickSource {
    /// Create a source at tick 0 with an empty state.
    pub fn new(stream_id: impl Into<String>, mutator: Box<dyn StateMutator>) -> Self {
        Self::with_state(stream_id, StreamState::default(), mutator)
    }

    /// Create a source at tick 0 seeded with `state`.
    pub fn with_state(
        stream_id: impl Into<String>,
        state: StreamState,
        mutator: Box<dyn StateMutator>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            head: AtomicU64::new(0),
            inner: Mutex::new(SourceInner { state, mutator }),
            advance_gate: Mutex::new(()),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Identifier of the stream this source produces.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Latest produced tick (lock-free).
    pub fn head(&self) -> TickId {
        self.head.load(Ordering::Acquire)
    }

    /// Advance by exactly one tick and notify listeners. Returns the new tick.
    pub fn advance(&self) -> TickId {
        let _gate = lock(&self.advance_gate);

        let (tick, delta) = {
            let mut guard = lock(&self.inner);
            let SourceInner { state, mutator } = &mut *guard;
            let tick = self.head().saturating_add(1);
            let delta = mutator.next_delta(tick, state);
            state.apply_delta(&delta);
            self.head.store(tick, Ordering::Release);
            (tick, delta)
        };

        self.notify(tick, &delta);
        tick
    }

    /// Consistent copy of `(tick, state)`.
    pub fn snapshot(&self) -> SourceSnapshot {
        let guard = lock(&self.inner);
        SourceSnapshot {
            tick_id: self.head(),
            state: guard.state.clone(),
        }
    }

    /// Register a listener. O(1).
    pub fn subscribe(&self, listener: TickListener) -> ListenerId {
        let id = ListenerId::new();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);
        debug!(listener_id = %id, "tick listener registered");
        id
    }

    /// Remove a listener. O(1). Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn notify(&self, tick: TickId, delta: &DeltaPayload) {
        // Copy the handles out so listeners may (un)subscribe while running.
        let listeners: Vec<(ListenerId, TickListener)> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(tick, delta))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(listener_id = %id, tick, error = %e, "tick listener failed"),
                Err(_) => warn!(listener_id = %id, tick, "tick listener panicked"),
            }
        }
    }
}

impl std::fmt::Debug for TickSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickSource")
            .field("stream_id", &self.stream_id)
            .field("head", &self.head())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use super::*;

    /// Sets `count` to the tick number.
    struct CountingMutator;

    impl StateMutator for CountingMutator {
        fn next_delta(&mut self, tick: TickId, _state: &StreamState) -> DeltaPayload {
            DeltaPayload {
                count: tick,
                ..DeltaPayload::default()
            }
        }
    }

    fn source() -> TickSource {
        TickSource::new("test", Box::new(CountingMutator))
    }

    #[test]
    fn starts_at_zero_and_advances_by_one() {
        let src = source();
        assert_eq!(src.head(), 0);
        assert_eq!(src.advance(), 1);
        assert_eq!(src.advance(), 2);
        assert_eq!(src.snapshot().tick_id, 2);
        assert_eq!(src.snapshot().state.count, 2);
    }

    #[test]
    fn listeners_see_strictly_increasing_ticks() {
        let src = source();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        src.subscribe(Arc::new(move |tick: TickId, delta: &DeltaPayload| {
            assert_eq!(delta.count, tick);
            sink.lock().unwrap().push(tick);
            Ok(())
        }));

        for _ in 0..50 {
            src.advance();
        }

        let seen = seen.lock().unwrap();
        let expected: Vec<TickId> = (1..=50).collect();
        assert_eq!(*seen, expected);
    }

    #[test]
    fn concurrent_advances_never_reorder_notifications() {
        let src = Arc::new(source());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        src.subscribe(Arc::new(move |tick: TickId, _: &DeltaPayload| {
            sink.lock().unwrap().push(tick);
            Ok(())
        }));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let src = Arc::clone(&src);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        src.advance();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 400);
        assert!(seen.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(seen.first(), Some(&1));
    }

    #[test]
    fn failing_and_panicking_listeners_are_isolated() {
        let src = source();
        let calls = Arc::new(AtomicU64::new(0));
        src.subscribe(Arc::new(|_: TickId, _: &DeltaPayload| {
            Err(ListenerError(String::from("boom")))
        }));
        src.subscribe(Arc::new(|_: TickId, _: &DeltaPayload| panic!("listener bug")));
        let counter = Arc::clone(&calls);
        src.subscribe(Arc::new(move |_: TickId, _: &DeltaPayload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert_eq!(src.advance(), 1);
        assert_eq!(src.advance(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let src = source();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let id = src.subscribe(Arc::new(move |_: TickId, _: &DeltaPayload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        src.advance();
        assert!(src.unsubscribe(id));
        assert!(!src.unsubscribe(id));
        src.advance();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(src.listener_count(), 0);
    }

    #[test]
    fn listener_may_read_snapshot_during_notification() {
        let src = Arc::new(source());
        let weak = Arc::downgrade(&src);
        let observed = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&observed);
        src.subscribe(Arc::new(move |tick: TickId, _: &DeltaPayload| {
            if let Some(src) = weak.upgrade() {
                assert_eq!(src.snapshot().tick_id, tick);
                sink.store(tick, Ordering::SeqCst);
            }
            Ok(())
        }));
        src.advance();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }
}
