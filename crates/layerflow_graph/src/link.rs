// SPDX-License-Identifier: MIT OR Apache-2.0
//! Link (edge) definitions for the graph.

use crate::node::NodeId;
use crate::port::SlotType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Unique identifier for a link within one graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A directed edge from one node's output slot to another node's input slot
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Unique link ID
    pub id: LinkId,
    /// Source node ID
    pub origin_id: NodeId,
    /// Source output index
    pub origin_slot: usize,
    /// Target node ID
    pub target_id: NodeId,
    /// Target input index
    pub target_slot: usize,
    /// Type copied from the target input when the link was made
    pub slot_type: SlotType,
    /// Last value written by the producer
    pub(crate) data: Option<Value>,
    /// Graph clock reading of the last trigger through this link
    pub(crate) last_triggered_at: Option<f64>,
}

impl Link {
    /// Create a new link
    pub fn new(
        id: LinkId,
        slot_type: SlotType,
        origin_id: NodeId,
        origin_slot: usize,
        target_id: NodeId,
        target_slot: usize,
    ) -> Self {
        Self {
            id,
            origin_id,
            origin_slot,
            target_id,
            target_slot,
            slot_type,
            data: None,
            last_triggered_at: None,
        }
    }

    /// Check if this link touches a specific node
    pub fn involves_node(&self, node_id: NodeId) -> bool {
        self.origin_id == node_id || self.target_id == node_id
    }

    /// Endpoint tuple `(origin, origin_slot, target, target_slot)`
    pub fn endpoints(&self) -> (NodeId, usize, NodeId, usize) {
        (self.origin_id, self.origin_slot, self.target_id, self.target_slot)
    }

    /// The value currently travelling through the link
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// When this link last carried a trigger. Used for drawing only.
    pub fn last_triggered_at(&self) -> Option<f64> {
        self.last_triggered_at
    }
}
