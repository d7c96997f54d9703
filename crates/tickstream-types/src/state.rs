//! Stream state model shared by the server and its clients.
//!
//! The authoritative side and every client apply the same
//! [`DeltaPayload`] through [`StreamState::apply_delta`], so a client that
//! has received the full causal chain of a tick holds exactly the state
//! the server held at that tick.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Tick identifier. Ticks start at 1; 0 means "nothing applied yet".
pub type TickId = u64;

/// A single node of the streamed graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Node {
    /// Stable node identifier.
    pub id: String,
    /// Current value carried by the node.
    pub value: u64,
    /// Tick at which the node was last written.
    pub updated_at: TickId,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Edge {
    /// Stable edge identifier.
    pub id: String,
    /// Source node identifier.
    pub from: String,
    /// Target node identifier.
    pub to: String,
}

/// Full state of the stream at some tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct StreamState {
    /// Monotonic counter advanced by the state mutator.
    pub count: u64,
    /// Nodes keyed by id.
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
    /// Edges keyed by id.
    #[serde(default)]
    pub edges: BTreeMap<String, Edge>,
}

/// Incremental change taking the state from tick `N-1` to tick `N`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct DeltaPayload {
    /// Counter value after the change.
    pub count: u64,
    /// Nodes inserted or overwritten.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
    /// Edges inserted or overwritten.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,
    /// Node ids removed, together with every edge touching them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_nodes: Vec<String>,
}

impl StreamState {
    /// Apply a delta in place.
    ///
    /// Removals run before upserts so a delta may remove and re-create
    /// the same node id within one tick.
    pub fn apply_delta(&mut self, delta: &DeltaPayload) {
        self.count = delta.count;

        for id in &delta.removed_nodes {
            self.nodes.remove(id);
            self.edges.retain(|_, edge| edge.from != *id && edge.to != *id);
        }
        for node in &delta.nodes {
            self.nodes.insert(node.id.clone(), node.clone());
        }
        for edge in &delta.edges {
            self.edges.insert(edge.id.clone(), edge.clone());
        }
    }

    /// Number of items a chunked serializer has to visit.
    pub fn item_count(&self) -> usize {
        self.nodes.len().saturating_add(self.edges.len())
    }
}
