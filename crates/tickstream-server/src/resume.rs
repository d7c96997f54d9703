//! How a new session catches up with the stream.
//!
//! When a `hello` arrives the hub describes the situation in a
//! [`ResumeContext`] and asks its [`ResumePolicy`] for a [`ResumePlan`].
//! The hub then carries the plan out while holding the delta history
//! lock, so no tick can slip between the catch-up messages and the live
//! fan-out.

use std::fmt::Debug;

use tickstream_types::TickId;

/// Inputs to a resume decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeContext {
    /// `resume.lastApplied` from the `hello`, if any.
    pub last_applied: Option<TickId>,
    /// Latest tick fanned out by the hub.
    pub head: TickId,
    /// Oldest tick still held in the delta history.
    pub oldest_retained: Option<TickId>,
    /// Longest replay the server is willing to send.
    pub replay_window: u64,
    /// Tick of the cached snapshot, if it is within the staleness limit.
    pub usable_snapshot: Option<TickId>,
}

impl ResumeContext {
    /// Whether every delta in `from..=head` is still in the history.
    pub fn history_covers(&self, from: TickId) -> bool {
        if from > self.head {
            return true;
        }
        self.oldest_retained.is_some_and(|oldest| oldest <= from)
    }
}

/// What the hub should enqueue for a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePlan {
    /// Send deltas `from..=head` out of the history. `from > head` means
    /// the client is already current.
    Replay {
        /// First tick to resend.
        from: TickId,
    },
    /// Send the cached snapshot, then the deltas after it.
    Snapshot,
    /// Nothing usable yet. The session receives no deltas until the
    /// scheduler installs a snapshot.
    Defer,
}

/// Strategy for catching a new session up.
pub trait ResumePolicy: Send + Sync + Debug {
    /// Decide how to catch up the session described by `ctx`.
    fn plan(&self, ctx: &ResumeContext) -> ResumePlan;
}

/// Replay when the client is close enough, else snapshot, else defer.
///
/// - A resuming client whose gap fits in the replay window and the
///   history gets a replay.
/// - Otherwise a usable cached snapshot (plus the deltas after it).
/// - Before the first tick the client's empty state is already current,
///   so it just follows the live deltas.
/// - Anything else waits for the next scheduler pass to install a
///   snapshot, so a fresh client always starts from one snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheapestResume;

impl ResumePolicy for CheapestResume {
    fn plan(&self, ctx: &ResumeContext) -> ResumePlan {
        if let Some(last_applied) = ctx.last_applied.filter(|t| *t <= ctx.head) {
            let from = last_applied.saturating_add(1);
            let gap = ctx.head.saturating_sub(last_applied);
            if gap <= ctx.replay_window && ctx.history_covers(from) {
                return ResumePlan::Replay { from };
            }
        }

        if ctx.usable_snapshot.is_some() {
            return ResumePlan::Snapshot;
        }

        if ctx.head == 0 {
            return ResumePlan::Replay { from: 1 };
        }

        ResumePlan::Defer
    }
}
