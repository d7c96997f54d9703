//! Seeded synthetic state mutator.
//!
//! Stands in for a real event producer: every tick bumps the counter,
//! rewrites one node in a fixed ring of `node_capacity` ids, links it to
//! the node written on the previous tick, and now and then drops an
//! older node. The ring keeps the state bounded however long the stream
//! runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tickstream_types::{DeltaPayload, Edge, Node, StreamState, TickId};

use crate::source::StateMutator;

/// Odds (1 in N) that a tick also removes an older node.
const REMOVAL_ODDS: u32 = 32;

/// Upper bound (exclusive) of synthetic node values.
const MAX_VALUE: u64 = 1_000;

/// Deterministic generator of deltas for demos and load tests.
#[derive(Debug)]
pub struct SyntheticMutator {
    rng: StdRng,
    node_capacity: u64,
}

impl SyntheticMutator {
    /// Create a mutator. A `node_capacity` of 0 is treated as 1.
    pub fn new(seed: u64, node_capacity: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            node_capacity: node_capacity.max(1),
        }
    }

    fn slot(&self, tick: TickId) -> u64 {
        tick.checked_rem(self.node_capacity).unwrap_or(0)
    }

    fn pick_removal(&mut self, state: &StreamState, keep: &str) -> Option<String> {
        let half = usize::try_from(self.node_capacity / 2).unwrap_or(usize::MAX);
        if state.nodes.len() <= half || self.rng.random_range(0..REMOVAL_ODDS) != 0 {
            return None;
        }
        let idx = self.rng.random_range(0..state.nodes.len());
        state
            .nodes
            .keys()
            .nth(idx)
            .filter(|id| id.as_str() != keep)
            .cloned()
    }
}

impl StateMutator for SyntheticMutator {
    fn next_delta(&mut self, tick: TickId, state: &StreamState) -> DeltaPayload {
        let node_id = format!("n{}", self.slot(tick));
        let node = Node {
            id: node_id.clone(),
            value: self.rng.random_range(0..MAX_VALUE),
            updated_at: tick,
        };

        let mut edges = Vec::new();
        if tick > 1 {
            let prev_id = format!("n{}", self.slot(tick.saturating_sub(1)));
            if prev_id != node_id && state.nodes.contains_key(&prev_id) {
                edges.push(Edge {
                    id: format!("e{}", self.slot(tick)),
                    from: prev_id,
                    to: node_id.clone(),
                });
            }
        }

        let removed_nodes = self
            .pick_removal(state, &node_id)
            .into_iter()
            .collect::<Vec<_>>();

        DeltaPayload {
            count: state.count.saturating_add(1),
            nodes: vec![node],
            edges,
            removed_nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(mutator: &mut SyntheticMutator, ticks: u64) -> StreamState {
        let mut state = StreamState::default();
        for tick in 1..=ticks {
            let delta = mutator.next_delta(tick, &state);
            state.apply_delta(&delta);
        }
        state
    }

    #[test]
    fn counter_tracks_ticks() {
        let mut m = SyntheticMutator::new(7, 16);
        let state = run(&mut m, 40);
        assert_eq!(state.count, 40);
    }

    #[test]
    fn node_ring_stays_bounded() {
        let mut m = SyntheticMutator::new(7, 8);
        let state = run(&mut m, 500);
        assert!(state.nodes.len() <= 8);
        assert!(state.edges.len() <= 8);
    }

    #[test]
    fn same_seed_same_stream() {
        let a = run(&mut SyntheticMutator::new(99, 32), 200);
        let b = run(&mut SyntheticMutator::new(99, 32), 200);
        assert_eq!(a, b);
    }

    #[test]
    fn edges_reference_live_nodes() {
        let mut m = SyntheticMutator::new(3, 64);
        let state = run(&mut m, 300);
        for edge in state.edges.values() {
            assert!(state.nodes.contains_key(&edge.to), "dangling edge {}", edge.id);
        }
    }
}
