// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph snapshots: serialization and two-phase deserialization.
//!
//! A [`Snapshot`] is the compact structural form of a graph. Loading one
//! creates every node first (so they all have IDs), then configures them, so
//! link bookkeeping can refer to any node regardless of record order.

use crate::graph::Graph;
use crate::group::Group;
use crate::link::{Link, LinkId};
use crate::node::{Node, NodeFlags, NodeId, NodeMode};
use crate::port::{Direction, InputSlot, OutputSlot, SlotType};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Error when encoding or decoding a snapshot
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Malformed or unencodable JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for snapshot encoding
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Serialized form of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
    /// Registry type identifier
    #[serde(rename = "type")]
    pub node_type: String,
    /// Position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<[f32; 2]>,
    /// Size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<[f32; 2]>,
    /// UI flags
    #[serde(default)]
    pub flags: NodeFlags,
    /// Execution mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<NodeMode>,
    /// Input slots including their link references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<InputSlot>>,
    /// Output slots including their link references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputSlot>>,
    /// Title, only when it differs from the type default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Property values
    #[serde(default)]
    pub properties: IndexMap<String, Value>,
    /// Title color
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Body color
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bgcolor: Option<String>,
    /// Shape name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    /// Instance priority override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Fields this version does not know about, kept verbatim
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl NodeRecord {
    /// Minimal record for a node type
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            id: None,
            node_type: node_type.into(),
            pos: None,
            size: None,
            flags: NodeFlags::default(),
            mode: None,
            inputs: None,
            outputs: None,
            title: None,
            properties: IndexMap::new(),
            color: None,
            bgcolor: None,
            shape: None,
            priority: None,
            extra: IndexMap::new(),
        }
    }
}

/// Serialized link: `[id, origin_id, origin_slot, target_id, target_slot, type]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord(
    /// Link ID
    pub LinkId,
    /// Origin node
    pub NodeId,
    /// Origin output slot
    pub usize,
    /// Target node
    pub NodeId,
    /// Target input slot
    pub usize,
    /// Link type
    pub SlotType,
);

impl From<&Link> for LinkRecord {
    fn from(link: &Link) -> Self {
        Self(
            link.id,
            link.origin_id,
            link.origin_slot,
            link.target_id,
            link.target_slot,
            link.slot_type.clone(),
        )
    }
}

impl LinkRecord {
    /// Rebuild the link
    pub fn to_link(&self) -> Link {
        let Self(id, origin, origin_slot, target, target_slot, slot_type) = self;
        Link::new(*id, slot_type.clone(), *origin, *origin_slot, *target, *target_slot)
    }
}

/// Structural snapshot of a graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Next node ID the graph will hand out
    #[serde(default, alias = "last_node_id")]
    pub next_node_id: u32,
    /// Next link ID the graph will hand out
    #[serde(default, alias = "last_link_id")]
    pub next_link_id: u32,
    /// Node records
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    /// Link records
    #[serde(default)]
    pub links: Vec<LinkRecord>,
    /// Visual groups
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Free-form configuration
    #[serde(default)]
    pub config: IndexMap<String, Value>,
}

impl Snapshot {
    /// Parse a snapshot from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Render compact JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Render indented JSON
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Outcome of [`Graph::configure`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Whether anything was substituted, pruned or repaired
    pub had_errors: bool,
    /// Types that had to be replaced by placeholders
    pub missing_types: Vec<String>,
    /// Links dropped because an endpoint was missing
    pub pruned_links: Vec<LinkId>,
}

impl Graph {
    /// Snapshot with nodes in insertion order
    pub fn serialize(&self) -> Snapshot {
        self.snapshot_of(self.nodes.keys().copied().collect())
    }

    /// Snapshot with nodes in execution order, for code generation
    pub fn serialize_in_order(&self) -> Snapshot {
        let order = if self.order_dirty {
            self.compute_execution_order()
        } else {
            self.execution_order.clone()
        };
        self.snapshot_of(order)
    }

    fn snapshot_of(&self, order: Vec<NodeId>) -> Snapshot {
        Snapshot {
            next_node_id: self.next_node_id,
            next_link_id: self.next_link_id,
            nodes: order
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .map(Node::serialize)
                .collect(),
            links: self.links.values().map(LinkRecord::from).collect(),
            groups: self.groups.clone(),
            config: self.config.clone(),
        }
    }

    /// Load a snapshot, replacing the graph unless `keep_old` is set.
    ///
    /// A node whose type cannot be created is kept as a placeholder and
    /// links that point nowhere are dropped; neither aborts the load. When
    /// merging, nodes and links whose IDs are already taken get fresh ones
    /// and every reference to them is rewritten.
    pub fn configure(&mut self, snapshot: &Snapshot, keep_old: bool) -> LoadReport {
        if !keep_old {
            self.clear();
        }
        let mut report = LoadReport::default();
        self.config.extend(snapshot.config.iter().map(|(k, v)| (k.clone(), v.clone())));

        self.begin_batch();

        // Phase A: create and add every node so all IDs exist
        let mut placed: Vec<(NodeId, &NodeRecord)> = Vec::with_capacity(snapshot.nodes.len());
        let mut node_ids: HashMap<NodeId, NodeId> = HashMap::new();
        for record in &snapshot.nodes {
            let mut node = match self.registry.create(&record.node_type, record.title.as_deref()) {
                Ok(node) => node,
                Err(err) => {
                    tracing::warn!("{err}, keeping the record as a placeholder");
                    report.had_errors = true;
                    report.missing_types.push(record.node_type.clone());
                    Node::placeholder(record.clone())
                }
            };
            node.id = record.id;
            match self.insert_node(node, false) {
                Ok(id) => {
                    if let Some(recorded) = record.id {
                        node_ids.entry(recorded).or_insert(id);
                    }
                    placed.push((id, record));
                }
                Err(err) => {
                    tracing::error!("Node {} not loaded: {err}", record.node_type);
                    report.had_errors = true;
                }
            }
        }

        let link_ids = self.merge_links(&snapshot.links, &node_ids, &mut report);
        self.next_link_id = self.next_link_id.max(snapshot.next_link_id);

        // Phase B: configure now that every node can be reached
        for (id, record) in &placed {
            if let Some(node) = self.nodes.get_mut(id) {
                node.apply_record(record);
                if remap_slot_links(node, &link_ids) {
                    tracing::warn!("Node {id} referenced links that are not in the snapshot");
                    report.had_errors = true;
                }
            }
        }
        report.had_errors |= self.repair_links(&mut report.pruned_links);
        for (id, record) in &placed {
            self.replay_connections(*id);
            self.with_behavior(*id, |behavior, _| behavior.on_configure(record));
        }

        self.groups = snapshot.groups.clone();
        self.next_node_id = self.next_node_id.max(snapshot.next_node_id);
        self.order_dirty = true;
        self.end_batch();
        self.version += 1;
        self.change();
        tracing::debug!(
            "Graph configured: {} nodes, {} links",
            self.nodes.len(),
            self.links.len()
        );
        report
    }

    /// Insert snapshot links with their endpoints translated to the loaded
    /// node IDs. Returns the recorded-to-live link ID map.
    fn merge_links(
        &mut self,
        records: &[LinkRecord],
        node_ids: &HashMap<NodeId, NodeId>,
        report: &mut LoadReport,
    ) -> HashMap<LinkId, LinkId> {
        let mut link_ids: HashMap<LinkId, LinkId> = HashMap::new();
        for record in records {
            let mut link = record.to_link();
            let (Some(&origin), Some(&target)) = (node_ids.get(&link.origin_id), node_ids.get(&link.target_id)) else {
                tracing::warn!("Link {} points to a node that is not in the snapshot, dropping it", record.0);
                report.pruned_links.push(record.0);
                report.had_errors = true;
                continue;
            };

            let id = match link_ids.get(&record.0) {
                Some(&id) => {
                    tracing::warn!("Link {} loaded twice, keeping the last one", record.0);
                    id
                }
                None if self.links.contains_key(&record.0) => self.fresh_link_id(),
                None => record.0,
            };
            link_ids.insert(record.0, id);
            link.id = id;
            link.origin_id = origin;
            link.target_id = target;
            self.next_link_id = self.next_link_id.max(id.0.saturating_add(1));
            self.links.insert(id, link);
        }
        link_ids
    }

    fn fresh_link_id(&mut self) -> LinkId {
        while self.links.contains_key(&LinkId(self.next_link_id)) {
            self.next_link_id += 1;
        }
        let id = LinkId(self.next_link_id);
        self.next_link_id += 1;
        id
    }

    /// Make link records and slot references agree. Returns whether anything was fixed.
    fn repair_links(&mut self, pruned: &mut Vec<LinkId>) -> bool {
        let mut repaired = false;

        let link_ids: Vec<LinkId> = self.links.keys().copied().collect();
        for link_id in link_ids {
            let Some(link) = self.links.get(&link_id) else {
                continue;
            };
            let (origin, origin_slot, target, target_slot) = link.endpoints();

            let origin_ok = self
                .nodes
                .get(&origin)
                .is_some_and(|node| origin_slot < node.outputs.len());
            let target_free = self
                .nodes
                .get(&target)
                .and_then(|node| node.inputs.get(target_slot))
                .map(|input| input.link.is_none() || input.link == Some(link_id));

            if !origin_ok || target_free != Some(true) || origin == target {
                tracing::warn!("Link {link_id} points to a missing node or slot, dropping it");
                self.links.shift_remove(&link_id);
                pruned.push(link_id);
                repaired = true;
                continue;
            }

            if let Some(input) = self.nodes.get_mut(&target).and_then(|n| n.inputs.get_mut(target_slot)) {
                if input.link.is_none() {
                    input.link = Some(link_id);
                    repaired = true;
                }
            }
            if let Some(output) = self.nodes.get_mut(&origin).and_then(|n| n.outputs.get_mut(origin_slot)) {
                if !output.links.contains(&link_id) {
                    output.links.push(link_id);
                    repaired = true;
                }
            }
        }

        let live: HashSet<LinkId> = self.links.keys().copied().collect();
        for (id, node) in &mut self.nodes {
            for input in &mut node.inputs {
                if input.link.is_some_and(|link_id| !live.contains(&link_id)) {
                    tracing::warn!("Node {id} input {} referenced a missing link", input.name);
                    input.link = None;
                    repaired = true;
                }
            }
            for output in &mut node.outputs {
                let before = output.links.len();
                output.links.retain(|link_id| live.contains(link_id));
                if output.links.len() != before {
                    tracing::warn!("Node {id} output {} referenced a missing link", output.name);
                    repaired = true;
                }
            }
        }

        // a link stored on the wrong slot still dangles from that slot
        let owners: HashMap<LinkId, (NodeId, usize, NodeId, usize)> = self
            .links
            .values()
            .map(|link| (link.id, link.endpoints()))
            .collect();
        for (id, node) in &mut self.nodes {
            for (slot, input) in node.inputs.iter_mut().enumerate() {
                if let Some(link_id) = input.link {
                    if owners.get(&link_id).map(|e| (e.2, e.3)) != Some((*id, slot)) {
                        input.link = None;
                        repaired = true;
                    }
                }
            }
            for (slot, output) in node.outputs.iter_mut().enumerate() {
                let before = output.links.len();
                output
                    .links
                    .retain(|link_id| owners.get(link_id).map(|e| (e.0, e.1)) == Some((*id, slot)));
                repaired |= output.links.len() != before;
            }
        }

        repaired
    }

    /// Tell a freshly configured node about the links on its slots
    fn replay_connections(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let mut changes: Vec<(Direction, usize, Link)> = Vec::new();
        for (slot, input) in node.inputs.iter().enumerate() {
            if let Some(link) = input.link.and_then(|link_id| self.links.get(&link_id)) {
                changes.push((Direction::Input, slot, link.clone()));
            }
        }
        for (slot, output) in node.outputs.iter().enumerate() {
            for link in output.links.iter().filter_map(|link_id| self.links.get(link_id)) {
                changes.push((Direction::Output, slot, link.clone()));
            }
        }
        for (direction, slot, link) in changes {
            self.notify_connection(id, direction, slot, true, &link);
        }
    }

    /// Unattached copy of a node with every link reference removed
    pub fn clone_node(&self, id: NodeId) -> Option<Node> {
        let original = self.nodes.get(&id)?;
        let mut record = original.serialize();
        record.id = None;
        for input in record.inputs.iter_mut().flatten() {
            input.link = None;
        }
        for output in record.outputs.iter_mut().flatten() {
            output.links.clear();
        }

        let mut copy = self.create_node(&record.node_type, None);
        if copy.has_errors() {
            copy = Node::placeholder(record.clone());
        }
        copy.apply_record(&record);
        if let Some(behavior) = copy.behavior.as_mut() {
            behavior.on_configure(&record);
        }
        Some(copy)
    }
}

/// Rewrite a node's slot link references from recorded to live IDs.
/// Returns whether a reference had no counterpart and was dropped.
fn remap_slot_links(node: &mut Node, link_ids: &HashMap<LinkId, LinkId>) -> bool {
    let mut dropped = false;
    for input in &mut node.inputs {
        if let Some(recorded) = input.link {
            input.link = link_ids.get(&recorded).copied();
            dropped |= input.link.is_none();
        }
    }
    for output in &mut node.outputs {
        let before = output.links.len();
        output.links = output.links.iter().filter_map(|recorded| link_ids.get(recorded).copied()).collect();
        dropped |= output.links.len() != before;
    }
    dropped
}
