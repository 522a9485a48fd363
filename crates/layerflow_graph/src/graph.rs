// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph data structure containing nodes and links.
//!
//! The graph is the single owner of every node and link. Mutations go through
//! it so the link bookkeeping on both endpoints stays consistent and the
//! cached execution order is invalidated whenever topology changes.

use crate::boundary::{BoundaryListener, GlobalSlot};
use crate::execution::{GraphStatus, NodeError};
use crate::group::Group;
use crate::link::{Link, LinkId};
use crate::node::{ConnectionChange, Node, NodeBehavior, NodeId, NodeMode};
use crate::port::{is_valid_connection, Direction, SlotType};
use crate::registry::{NodeRegistry, RegistryError};
use crate::settings::GraphSettings;
use crate::snapshot::NodeRecord;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Observer of graph-level events, for editors and schedulers
pub trait GraphHooks {
    /// Something structural changed; `version` is the new graph version
    fn on_change(&mut self, _version: u64) {}

    /// A node was added
    fn on_node_added(&mut self, _id: NodeId) {}

    /// A node was removed
    fn on_node_removed(&mut self, _id: NodeId) {}

    /// A link was made (`connected`) or broken
    fn on_connection_change(&mut self, _link: &Link, _connected: bool) {}

    /// The graph started running
    fn on_start(&mut self) {}

    /// The graph stopped running
    fn on_stop(&mut self) {}

    /// One iteration of [`Graph::run_step`] finished
    fn on_execute_step(&mut self) {}

    /// [`Graph::run_step`] finished its passes, also when one of them failed
    fn on_after_execute(&mut self) {}
}

/// A dataflow graph
pub struct Graph {
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) settings: GraphSettings,
    pub(crate) nodes: IndexMap<NodeId, Node>,
    pub(crate) links: IndexMap<LinkId, Link>,
    pub(crate) groups: Vec<Group>,
    pub(crate) next_node_id: u32,
    pub(crate) next_link_id: u32,
    pub(crate) version: u64,
    pub(crate) execution_order: Vec<NodeId>,
    pub(crate) executable: Vec<NodeId>,
    pub(crate) order_dirty: bool,
    pub(crate) batch_depth: usize,
    pub(crate) global_inputs: IndexMap<String, GlobalSlot>,
    pub(crate) global_outputs: IndexMap<String, GlobalSlot>,
    pub(crate) status: GraphStatus,
    pub(crate) epoch: Instant,
    pub(crate) global_time: f64,
    pub(crate) fixed_time: f64,
    pub(crate) iteration: u64,
    pub(crate) execution_time: f64,
    pub(crate) elapsed_time: f64,
    pub(crate) last_update: Option<Instant>,
    pub(crate) errors_in_execution: bool,
    pub(crate) config: IndexMap<String, Value>,
    pub(crate) hooks: Option<Box<dyn GraphHooks>>,
    pub(crate) boundary: Option<Box<dyn BoundaryListener>>,
}

impl Graph {
    /// Create a new empty graph backed by `registry`
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self::with_settings(registry, GraphSettings::default())
    }

    /// Create a new empty graph with explicit settings
    pub fn with_settings(registry: Arc<NodeRegistry>, settings: GraphSettings) -> Self {
        Self {
            registry,
            settings,
            nodes: IndexMap::new(),
            links: IndexMap::new(),
            groups: Vec::new(),
            next_node_id: 1,
            next_link_id: 1,
            version: 0,
            execution_order: Vec::new(),
            executable: Vec::new(),
            order_dirty: false,
            batch_depth: 0,
            global_inputs: IndexMap::new(),
            global_outputs: IndexMap::new(),
            status: GraphStatus::Stopped,
            epoch: Instant::now(),
            global_time: 0.0,
            fixed_time: 0.0,
            iteration: 0,
            execution_time: 0.0,
            elapsed_time: 0.0,
            last_update: None,
            errors_in_execution: false,
            config: IndexMap::new(),
            hooks: None,
            boundary: None,
        }
    }

    /// Node type registry used to create nodes
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Engine settings
    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }

    /// Mutable engine settings
    pub fn settings_mut(&mut self) -> &mut GraphSettings {
        &mut self.settings
    }

    /// Install the graph-level observer
    pub fn set_hooks(&mut self, hooks: Box<dyn GraphHooks>) {
        self.hooks = Some(hooks);
    }

    /// Remove the graph-level observer
    pub fn take_hooks(&mut self) -> Option<Box<dyn GraphHooks>> {
        self.hooks.take()
    }

    /// Free-form configuration carried through snapshots
    pub fn config(&self) -> &IndexMap<String, Value> {
        &self.config
    }

    /// Mutable free-form configuration
    pub fn config_mut(&mut self) -> &mut IndexMap<String, Value> {
        &mut self.config
    }

    /// Change counter, bumped by every structural mutation
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Create an unattached node, falling back to a placeholder for unknown types
    pub fn create_node(&self, type_id: &str, title: Option<&str>) -> Node {
        match self.registry.create(type_id, title) {
            Ok(node) => node,
            Err(RegistryError::UnknownType(type_id)) => {
                tracing::warn!("Node type not registered: {type_id}, using a placeholder");
                let mut record = NodeRecord::new(type_id);
                record.title = title.map(str::to_string);
                Node::placeholder(record)
            }
        }
    }

    /// Create a node of a registered type and add it
    pub fn add_new(&mut self, type_id: &str) -> Result<NodeId, GraphError> {
        let node = self.create_node(type_id, None);
        self.add(node)
    }

    /// Add a node to the graph
    pub fn add(&mut self, node: Node) -> Result<NodeId, GraphError> {
        self.insert_node(node, true)
    }

    pub(crate) fn insert_node(&mut self, mut node: Node, compute_order: bool) -> Result<NodeId, GraphError> {
        if self.nodes.len() >= self.settings.max_nodes {
            return Err(GraphError::NodeLimitExceeded {
                limit: self.settings.max_nodes,
            });
        }

        let id = self.claim_node_id(node.id);
        node.id = Some(id);
        if self.settings.align_to_grid {
            node.align_to_grid(self.settings.grid_size);
        }
        self.nodes.insert(id, node);
        self.version += 1;
        tracing::debug!("Node added: {id}");

        self.with_behavior(id, |behavior, graph| behavior.on_added(graph, id));

        self.order_dirty = true;
        if compute_order && self.batch_depth == 0 {
            self.update_execution_order();
        }
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_node_added(id);
        }
        self.change();
        Ok(id)
    }

    fn claim_node_id(&mut self, requested: Option<NodeId>) -> NodeId {
        match requested {
            Some(id) if self.nodes.contains_key(&id) => {
                tracing::warn!("There is already a node with ID {id}, changing it");
                self.fresh_node_id()
            }
            Some(id) => {
                self.next_node_id = self.next_node_id.max(id.0.saturating_add(1));
                id
            }
            None => self.fresh_node_id(),
        }
    }

    fn fresh_node_id(&mut self) -> NodeId {
        while self.nodes.contains_key(&NodeId(self.next_node_id)) {
            self.next_node_id += 1;
        }
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    /// Remove a node and every link touching it
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.get(&id)?;
        let linked_inputs: Vec<usize> = (0..node.inputs.len())
            .filter(|&slot| node.inputs[slot].link.is_some())
            .collect();
        let linked_outputs: Vec<usize> = (0..node.outputs.len())
            .filter(|&slot| node.outputs[slot].is_connected())
            .collect();

        self.begin_batch();
        for slot in linked_inputs {
            self.disconnect_input(id, slot);
        }
        for slot in linked_outputs {
            self.disconnect_output(id, slot, None);
        }

        let mut node = self.nodes.shift_remove(&id)?;
        if let Some(behavior) = node.behavior.as_mut() {
            behavior.on_removed();
        }
        node.id = None;
        self.version += 1;
        tracing::debug!("Node removed: {id}");

        self.order_dirty = true;
        self.end_batch();
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_node_removed(id);
        }
        self.change();
        Some(node)
    }

    /// Remove every node, link, group and boundary port and reset the counters
    pub fn clear(&mut self) {
        self.stop();
        for node in self.nodes.values_mut() {
            if let Some(behavior) = node.behavior.as_mut() {
                behavior.on_removed();
            }
        }
        self.nodes.clear();
        self.links.clear();
        self.groups.clear();
        self.next_node_id = 1;
        self.next_link_id = 1;
        self.execution_order.clear();
        self.executable.clear();
        self.order_dirty = false;
        self.global_inputs.clear();
        self.global_outputs.clear();
        self.config.clear();
        self.global_time = 0.0;
        self.fixed_time = 0.0;
        self.iteration = 0;
        self.execution_time = 0.0;
        self.elapsed_time = 0.0;
        self.last_update = None;
        self.errors_in_execution = false;
        self.version += 1;
        self.change();
    }

    /// Get a node by ID
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Get a mutable node by ID
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Get all nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Get all node IDs in insertion order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Get the number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes of a given type
    pub fn find_nodes_by_type<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = &'a Node> {
        self.nodes.values().filter(move |node| node.node_type == node_type)
    }

    /// Nodes showing a given title
    pub fn find_nodes_by_title<'a>(&'a self, title: &'a str) -> impl Iterator<Item = &'a Node> {
        self.nodes.values().filter(move |node| node.title() == title)
    }

    /// First node showing a given title
    pub fn find_node_by_title(&self, title: &str) -> Option<&Node> {
        self.nodes.values().find(|node| node.title() == title)
    }

    /// Get a link by ID
    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    /// Get all links
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Get the number of links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Links touching a node
    pub fn links_for_node(&self, id: NodeId) -> impl Iterator<Item = &Link> {
        self.links.values().filter(move |link| link.involves_node(id))
    }

    /// The link feeding an input
    pub fn input_link(&self, id: NodeId, slot: usize) -> Option<&Link> {
        let link_id = self.nodes.get(&id)?.inputs.get(slot)?.link?;
        self.links.get(&link_id)
    }

    /// Links leaving an output
    pub fn output_links(&self, id: NodeId, slot: usize) -> Vec<&Link> {
        self.nodes
            .get(&id)
            .and_then(|node| node.outputs.get(slot))
            .map(|output| output.links.iter().filter_map(|link_id| self.links.get(link_id)).collect())
            .unwrap_or_default()
    }

    /// The node feeding an input
    pub fn input_node(&self, id: NodeId, slot: usize) -> Option<&Node> {
        let link = self.input_link(id, slot)?;
        self.nodes.get(&link.origin_id)
    }

    /// Connect an output to an input, or `None` if any precondition fails
    pub fn connect(
        &mut self,
        origin: NodeId,
        origin_slot: usize,
        target: NodeId,
        target_slot: usize,
    ) -> Option<LinkId> {
        match self.try_connect(origin, origin_slot, target, target_slot) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::debug!("Connection refused: {err}");
                None
            }
        }
    }

    /// Connect slots addressed by name
    pub fn connect_by_name(
        &mut self,
        origin: NodeId,
        output: &str,
        target: NodeId,
        input: &str,
    ) -> Result<LinkId, ConnectionError> {
        let origin_slot = self
            .nodes
            .get(&origin)
            .ok_or(ConnectionError::NodeNotFound(origin))?
            .find_output_slot(output)
            .ok_or_else(|| ConnectionError::SlotNameNotFound {
                node: origin,
                name: output.to_string(),
            })?;
        let target_slot = self
            .nodes
            .get(&target)
            .ok_or(ConnectionError::NodeNotFound(target))?
            .find_input_slot(input)
            .ok_or_else(|| ConnectionError::SlotNameNotFound {
                node: target,
                name: input.to_string(),
            })?;
        self.try_connect(origin, origin_slot, target, target_slot)
    }

    /// Connect an output to an input
    pub fn try_connect(
        &mut self,
        origin: NodeId,
        origin_slot: usize,
        target: NodeId,
        target_slot: usize,
    ) -> Result<LinkId, ConnectionError> {
        let origin_node = self.nodes.get(&origin).ok_or(ConnectionError::NodeNotFound(origin))?;
        let target_node = self.nodes.get(&target).ok_or(ConnectionError::NodeNotFound(target))?;
        let output = origin_node
            .outputs
            .get(origin_slot)
            .ok_or(ConnectionError::OutputNotFound {
                node: origin,
                slot: origin_slot,
            })?;
        let input = target_node
            .inputs
            .get(target_slot)
            .ok_or(ConnectionError::InputNotFound {
                node: target,
                slot: target_slot,
            })?;

        if origin == target {
            return Err(ConnectionError::SelfLoop);
        }

        let output_type = output.slot_type.clone();
        let input_type = input.slot_type.clone();
        let replaced = input.link;

        let accepted = self
            .with_behavior(target, |behavior, _| behavior.on_connect_input(target_slot, &output_type))
            .unwrap_or(true);
        if !accepted {
            tracing::warn!("Node {target} refused a link on input {target_slot}");
            return Err(ConnectionError::Vetoed(target));
        }

        if !is_valid_connection(&output_type, &input_type) {
            return Err(ConnectionError::TypeMismatch {
                output: output_type,
                input: input_type,
            });
        }

        if let Some(previous) = replaced {
            self.unlink(previous);
        }

        let id = LinkId(self.next_link_id);
        self.next_link_id += 1;
        let link = Link::new(id, input_type, origin, origin_slot, target, target_slot);
        self.links.insert(id, link.clone());
        if let Some(output) = self.nodes.get_mut(&origin).and_then(|n| n.outputs.get_mut(origin_slot)) {
            output.links.push(id);
        }
        if let Some(input) = self.nodes.get_mut(&target).and_then(|n| n.inputs.get_mut(target_slot)) {
            input.link = Some(id);
        }
        self.version += 1;
        tracing::debug!("Link {id} created: {origin}:{origin_slot} -> {target}:{target_slot}");

        self.notify_connection(target, Direction::Input, target_slot, true, &link);
        self.notify_connection(origin, Direction::Output, origin_slot, true, &link);
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_connection_change(&link, true);
        }

        self.invalidate_order();
        self.change();
        Ok(id)
    }

    /// Remove the link feeding an input
    pub fn disconnect_input(&mut self, id: NodeId, slot: usize) -> bool {
        let Some(link_id) = self
            .nodes
            .get(&id)
            .and_then(|node| node.inputs.get(slot))
            .and_then(|input| input.link)
        else {
            return false;
        };
        self.unlink(link_id);
        self.invalidate_order();
        self.change();
        true
    }

    /// Remove the links leaving an output, optionally only those reaching `target`
    pub fn disconnect_output(&mut self, id: NodeId, slot: usize, target: Option<NodeId>) -> bool {
        let Some(output) = self.nodes.get(&id).and_then(|node| node.outputs.get(slot)) else {
            return false;
        };
        let doomed: Vec<LinkId> = output
            .links
            .iter()
            .copied()
            .filter(|link_id| match target {
                Some(target) => self.links.get(link_id).is_some_and(|link| link.target_id == target),
                None => true,
            })
            .collect();
        if doomed.is_empty() {
            return false;
        }
        for link_id in doomed {
            self.unlink(link_id);
        }
        self.invalidate_order();
        self.change();
        true
    }

    /// Remove a link by ID
    pub fn remove_link(&mut self, id: LinkId) -> bool {
        if self.unlink(id).is_none() {
            return false;
        }
        self.invalidate_order();
        self.change();
        true
    }

    /// Drop a link and clear both endpoints. Order is left to the caller.
    pub(crate) fn unlink(&mut self, id: LinkId) -> Option<Link> {
        let link = self.links.shift_remove(&id)?;
        if let Some(input) = self
            .nodes
            .get_mut(&link.target_id)
            .and_then(|node| node.inputs.get_mut(link.target_slot))
        {
            if input.link == Some(id) {
                input.link = None;
            }
        }
        if let Some(output) = self
            .nodes
            .get_mut(&link.origin_id)
            .and_then(|node| node.outputs.get_mut(link.origin_slot))
        {
            output.links.retain(|link_id| *link_id != id);
        }
        self.version += 1;
        self.order_dirty = true;
        tracing::debug!("Link {id} removed");

        self.notify_connection(link.target_id, Direction::Input, link.target_slot, false, &link);
        self.notify_connection(link.origin_id, Direction::Output, link.origin_slot, false, &link);
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_connection_change(&link, false);
        }
        Some(link)
    }

    pub(crate) fn notify_connection(
        &mut self,
        id: NodeId,
        direction: Direction,
        slot: usize,
        connected: bool,
        link: &Link,
    ) {
        let slot_name = self.nodes.get(&id).and_then(|node| match direction {
            Direction::Input => node.inputs.get(slot).map(|s| s.name.clone()),
            Direction::Output => node.outputs.get(slot).map(|s| s.name.clone()),
        });
        let Some(slot_name) = slot_name else {
            return;
        };
        let change = ConnectionChange {
            direction,
            slot,
            connected,
            link: link.clone(),
            slot_name,
        };
        self.with_behavior(id, |behavior, _| behavior.on_connections_change(&change));
    }

    /// Append an input slot to an attached node
    pub fn add_input(&mut self, id: NodeId, name: &str, slot_type: impl Into<SlotType>) -> Option<usize> {
        let slot = self.nodes.get_mut(&id)?.add_input(name, slot_type);
        self.version += 1;
        self.change();
        Some(slot)
    }

    /// Append an output slot to an attached node
    pub fn add_output(&mut self, id: NodeId, name: &str, slot_type: impl Into<SlotType>) -> Option<usize> {
        let slot = self.nodes.get_mut(&id)?.add_output(name, slot_type);
        self.version += 1;
        self.change();
        Some(slot)
    }

    /// Remove an input slot, disconnecting it first
    pub fn remove_input(&mut self, id: NodeId, slot: usize) -> bool {
        if self.nodes.get(&id).and_then(|node| node.inputs.get(slot)).is_none() {
            return false;
        }
        self.begin_batch();
        self.disconnect_input(id, slot);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.inputs.remove(slot);
            for input in &node.inputs[slot..] {
                if let Some(link) = input.link.and_then(|link_id| self.links.get_mut(&link_id)) {
                    link.target_slot -= 1;
                }
            }
            node.size = node.compute_size();
        }
        self.version += 1;
        self.order_dirty = true;
        self.end_batch();
        self.change();
        true
    }

    /// Remove an output slot, disconnecting it first
    pub fn remove_output(&mut self, id: NodeId, slot: usize) -> bool {
        if self.nodes.get(&id).and_then(|node| node.outputs.get(slot)).is_none() {
            return false;
        }
        self.begin_batch();
        self.disconnect_output(id, slot, None);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.outputs.remove(slot);
            for output in &node.outputs[slot..] {
                for link_id in &output.links {
                    if let Some(link) = self.links.get_mut(link_id) {
                        link.origin_slot -= 1;
                    }
                }
            }
            node.size = node.compute_size();
        }
        self.version += 1;
        self.order_dirty = true;
        self.end_batch();
        self.change();
        true
    }

    /// Set a property, unless the node keeps its old value
    pub fn set_property(&mut self, id: NodeId, name: &str, value: impl Into<Value>) -> bool {
        if !self.nodes.contains_key(&id) {
            return false;
        }
        let value = value.into();
        let keep_old = self
            .with_behavior(id, |behavior, _| behavior.on_property_changed(name, &value))
            .unwrap_or(false);
        if !keep_old {
            self.store_property(id, name, value);
        }
        true
    }

    pub(crate) fn store_property(&mut self, id: NodeId, name: &str, value: Value) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.properties.insert(name.to_string(), value);
            self.version += 1;
            self.change();
        }
    }

    /// Move a node
    pub fn set_position(&mut self, id: NodeId, x: f32, y: f32) -> bool {
        self.edit_node(id, |node| node.pos = [x, y])
    }

    /// Resize a node
    pub fn set_size(&mut self, id: NodeId, width: f32, height: f32) -> bool {
        self.edit_node(id, |node| node.size = [width, height])
    }

    /// Rename a node
    pub fn set_title(&mut self, id: NodeId, title: &str) -> bool {
        self.edit_node(id, |node| node.title = title.to_string())
    }

    /// Change when a node runs
    pub fn set_mode(&mut self, id: NodeId, mode: NodeMode) -> bool {
        self.edit_node(id, |node| node.mode = mode)
    }

    /// Collapse or expand a node
    pub fn collapse(&mut self, id: NodeId, collapsed: bool) -> bool {
        self.edit_node(id, |node| node.flags.collapsed = collapsed)
    }

    /// Pin or unpin a node
    pub fn pin(&mut self, id: NodeId, pinned: bool) -> bool {
        self.edit_node(id, |node| node.flags.pinned = pinned)
    }

    /// Set the title and body colors
    pub fn set_colors(&mut self, id: NodeId, color: Option<&str>, bgcolor: Option<&str>) -> bool {
        self.edit_node(id, |node| {
            node.color = color.map(str::to_string);
            node.bgcolor = bgcolor.map(str::to_string);
        })
    }

    /// Override (or reset) the ordering priority of one node
    pub fn set_priority(&mut self, id: NodeId, priority: Option<i32>) -> bool {
        if !self.edit_node(id, |node| node.priority = priority) {
            return false;
        }
        self.invalidate_order();
        true
    }

    fn edit_node(&mut self, id: NodeId, edit: impl FnOnce(&mut Node)) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        edit(node);
        self.version += 1;
        self.change();
        true
    }

    /// Add a group and return its index
    pub fn add_group(&mut self, group: Group) -> usize {
        self.groups.push(group);
        self.version += 1;
        self.change();
        self.groups.len() - 1
    }

    /// Remove a group by index
    pub fn remove_group(&mut self, index: usize) -> Option<Group> {
        if index >= self.groups.len() {
            return None;
        }
        let group = self.groups.remove(index);
        self.version += 1;
        self.change();
        Some(group)
    }

    /// Visual groups
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Top-most node under a point
    pub fn node_on_pos(&self, x: f32, y: f32, margin: f32) -> Option<NodeId> {
        self.nodes
            .values()
            .rev()
            .find(|node| node.is_point_inside(x, y, margin))
            .and_then(Node::id)
    }

    /// Top-most group under a point
    pub fn group_on_pos(&self, x: f32, y: f32) -> Option<usize> {
        self.groups.iter().rposition(|group| group.is_point_inside(x, y, 2.0))
    }

    /// Nodes whose centre lies in a group
    pub fn nodes_in_group(&self, index: usize) -> Vec<NodeId> {
        let Some(group) = self.groups.get(index) else {
            return Vec::new();
        };
        self.nodes
            .iter()
            .filter(|(_, node)| group.contains_node(node))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Defer order recomputation until the matching [`end_batch`](Self::end_batch)
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    /// Close a batch, recomputing the order if anything changed
    pub fn end_batch(&mut self) {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth == 0 && self.order_dirty {
            self.update_execution_order();
        }
    }

    pub(crate) fn invalidate_order(&mut self) {
        self.order_dirty = true;
        if self.batch_depth == 0 {
            self.update_execution_order();
        }
    }

    pub(crate) fn change(&mut self) {
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_change(self.version);
        }
    }

    /// Run `f` with a node's behavior detached so it can borrow the graph.
    ///
    /// Returns `None` if the node does not exist or is already running.
    pub(crate) fn with_behavior<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut dyn NodeBehavior, &mut Graph) -> R,
    ) -> Option<R> {
        let mut behavior = self.nodes.get_mut(&id)?.behavior.take()?;
        let result = f(behavior.as_mut(), self);
        self.restore_behavior(id, behavior);
        Some(result)
    }

    /// Put a detached behavior back. If its node left the graph meanwhile
    /// the behavior gets the removal notice it missed.
    pub(crate) fn restore_behavior(&mut self, id: NodeId, mut behavior: Box<dyn NodeBehavior>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.behavior.is_none() {
                node.behavior = Some(behavior);
                return;
            }
        }
        behavior.on_removed();
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(Arc::new(NodeRegistry::new()))
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes)
            .field("links", &self.links)
            .field("groups", &self.groups)
            .field("version", &self.version)
            .field("status", &self.status)
            .field("execution_order", &self.execution_order)
            .finish_non_exhaustive()
    }
}

/// Error when creating a link
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Output slot index out of range
    #[error("Output slot {slot} not found on node {node}")]
    OutputNotFound {
        /// Node
        node: NodeId,
        /// Slot index
        slot: usize,
    },

    /// Input slot index out of range
    #[error("Input slot {slot} not found on node {node}")]
    InputNotFound {
        /// Node
        node: NodeId,
        /// Slot index
        slot: usize,
    },

    /// No slot with this name
    #[error("Slot {name:?} not found on node {node}")]
    SlotNameNotFound {
        /// Node
        node: NodeId,
        /// Slot name
        name: String,
    },

    /// Self-loop not allowed
    #[error("Self-loop not allowed")]
    SelfLoop,

    /// Incompatible slot types
    #[error("Incompatible slot types: {output} -> {input}")]
    TypeMismatch {
        /// Output type
        output: SlotType,
        /// Input type
        input: SlotType,
    },

    /// The target node refused the link
    #[error("Node {0} refused the connection")]
    Vetoed(NodeId),
}

/// Error raised by graph operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// The node limit from [`GraphSettings::max_nodes`] was reached
    #[error("Max number of nodes in a graph reached ({limit})")]
    NodeLimitExceeded {
        /// Configured limit
        limit: usize,
    },

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// A node body failed
    #[error("Node {node} failed: {source}")]
    Execution {
        /// Failing node
        node: NodeId,
        /// What went wrong
        source: NodeError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn number_node() -> Node {
        Node::new("test/number")
            .with_input("in", "number")
            .with_output("out", "number")
    }

    #[derive(Default)]
    struct ChangeLog {
        events: Vec<String>,
    }

    struct Recorder(Rc<RefCell<ChangeLog>>);

    impl NodeBehavior for Recorder {
        fn on_connections_change(&mut self, change: &ConnectionChange) {
            self.0.borrow_mut().events.push(format!(
                "{:?}:{}:{}:{}",
                change.direction, change.slot, change.slot_name, change.connected
            ));
        }

        fn on_removed(&mut self) {
            self.0.borrow_mut().events.push("removed".into());
        }
    }

    #[test]
    fn test_add_assigns_increasing_ids() {
        let mut graph = Graph::default();
        let a = graph.add(number_node()).unwrap();
        let b = graph.add(number_node()).unwrap();
        assert_eq!(a, NodeId(1));
        assert_eq!(b, NodeId(2));
        assert_eq!(graph.node(a).and_then(Node::id), Some(a));
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_colliding_id_is_replaced() {
        let mut graph = Graph::default();
        let mut first = number_node();
        first.id = Some(NodeId(5));
        let mut second = number_node();
        second.id = Some(NodeId(5));

        assert_eq!(graph.add(first).unwrap(), NodeId(5));
        assert_eq!(graph.add(second).unwrap(), NodeId(6));
        assert_eq!(graph.add(number_node()).unwrap(), NodeId(7));
    }

    #[test]
    fn test_node_limit() {
        let mut graph = Graph::default();
        graph.settings_mut().max_nodes = 1;
        graph.add(number_node()).unwrap();
        let version = graph.version();
        let err = graph.add(number_node()).unwrap_err();
        assert_eq!(err, GraphError::NodeLimitExceeded { limit: 1 });
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.version(), version);
    }

    #[test]
    fn test_connect_updates_both_ends() {
        let mut graph = Graph::default();
        let a = graph.add(number_node()).unwrap();
        let b = graph.add(number_node()).unwrap();
        let link = graph.connect(a, 0, b, 0).unwrap();

        assert_eq!(graph.node(a).unwrap().outputs()[0].links(), &[link]);
        assert_eq!(graph.node(b).unwrap().inputs()[0].link(), Some(link));
        assert_eq!(graph.link(link).unwrap().endpoints(), (a, 0, b, 0));
        assert_eq!(graph.input_node(b, 0).and_then(Node::id), Some(a));
    }

    #[test]
    fn test_connect_rejections() {
        let mut graph = Graph::default();
        let a = graph.add(number_node()).unwrap();
        let text = graph
            .add(Node::new("test/text").with_input("in", "string"))
            .unwrap();

        assert_eq!(graph.try_connect(a, 0, a, 0), Err(ConnectionError::SelfLoop));
        assert_eq!(
            graph.try_connect(a, 3, text, 0),
            Err(ConnectionError::OutputNotFound { node: a, slot: 3 })
        );
        assert_eq!(
            graph.try_connect(a, 0, NodeId(99), 0),
            Err(ConnectionError::NodeNotFound(NodeId(99)))
        );
        assert!(matches!(
            graph.try_connect(a, 0, text, 0),
            Err(ConnectionError::TypeMismatch { .. })
        ));
        assert_eq!(graph.link_count(), 0);
    }

    #[test]
    fn test_connect_replaces_existing_input_link() {
        let mut graph = Graph::default();
        let a = graph.add(number_node()).unwrap();
        let b = graph.add(number_node()).unwrap();
        let c = graph.add(number_node()).unwrap();

        let first = graph.connect(a, 0, c, 0).unwrap();
        let second = graph.connect(b, 0, c, 0).unwrap();

        assert!(graph.link(first).is_none());
        assert!(graph.node(a).unwrap().outputs()[0].links().is_empty());
        assert_eq!(graph.node(c).unwrap().inputs()[0].link(), Some(second));
        assert_eq!(graph.link_count(), 1);
    }

    #[test]
    fn test_connection_notifications() {
        let log = Rc::new(RefCell::new(ChangeLog::default()));
        let mut graph = Graph::default();
        let a = graph
            .add(number_node().with_behavior(Recorder(Rc::clone(&log))))
            .unwrap();
        let b = graph
            .add(number_node().with_behavior(Recorder(Rc::clone(&log))))
            .unwrap();

        graph.connect(a, 0, b, 0).unwrap();
        assert!(graph.disconnect_input(b, 0));
        assert!(!graph.disconnect_input(b, 0));

        assert_eq!(
            log.borrow().events,
            vec![
                "Input:0:in:true",
                "Output:0:out:true",
                "Input:0:in:false",
                "Output:0:out:false",
            ]
        );
    }

    struct OnlyTensors;

    impl NodeBehavior for OnlyTensors {
        fn on_connect_input(&mut self, _slot: usize, output_type: &SlotType) -> bool {
            *output_type == SlotType::named("tensor")
        }
    }

    #[test]
    fn test_target_can_veto() {
        let mut graph = Graph::default();
        let a = graph.add(number_node()).unwrap();
        let picky = graph
            .add(Node::new("test/picky").with_input("in", SlotType::Any).with_behavior(OnlyTensors))
            .unwrap();
        assert_eq!(graph.try_connect(a, 0, picky, 0), Err(ConnectionError::Vetoed(picky)));
    }

    #[test]
    fn test_remove_clears_surviving_endpoints() {
        let log = Rc::new(RefCell::new(ChangeLog::default()));
        let mut graph = Graph::default();
        let a = graph.add(number_node()).unwrap();
        let b = graph
            .add(number_node().with_behavior(Recorder(Rc::clone(&log))))
            .unwrap();
        let c = graph.add(number_node()).unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(b, 0, c, 0).unwrap();

        let removed = graph.remove(b).unwrap();
        assert_eq!(removed.id(), None);
        assert_eq!(graph.link_count(), 0);
        assert!(graph.node(a).unwrap().outputs()[0].links().is_empty());
        assert!(graph.node(c).unwrap().inputs()[0].link().is_none());
        assert_eq!(log.borrow().events.last().map(String::as_str), Some("removed"));
        assert!(!graph.execution_order().contains(&b));
    }

    #[test]
    fn test_disconnect_output_to_one_target() {
        let mut graph = Graph::default();
        let a = graph.add(number_node()).unwrap();
        let b = graph.add(number_node()).unwrap();
        let c = graph.add(number_node()).unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        let keep = graph.connect(a, 0, c, 0).unwrap();

        assert!(graph.disconnect_output(a, 0, Some(b)));
        assert_eq!(graph.node(a).unwrap().outputs()[0].links(), &[keep]);
        assert!(!graph.disconnect_output(a, 0, Some(b)));
    }

    #[test]
    fn test_remove_input_renumbers_links() {
        let mut graph = Graph::default();
        let a = graph.add(number_node()).unwrap();
        let b = graph
            .add(
                Node::new("test/pair")
                    .with_input("x", "number")
                    .with_input("y", "number"),
            )
            .unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        let y = graph.connect(a, 0, b, 1).unwrap();

        assert!(graph.remove_input(b, 0));
        assert_eq!(graph.node(b).unwrap().inputs().len(), 1);
        assert_eq!(graph.link(y).unwrap().target_slot, 0);
        assert_eq!(graph.link_count(), 1);
    }

    #[test]
    fn test_remove_output_renumbers_links() {
        let mut graph = Graph::default();
        let a = graph
            .add(
                Node::new("test/split")
                    .with_output("x", "number")
                    .with_output("y", "number"),
            )
            .unwrap();
        let b = graph.add(number_node()).unwrap();
        let y = graph.connect(a, 1, b, 0).unwrap();

        assert!(graph.remove_output(a, 0));
        assert_eq!(graph.link(y).unwrap().origin_slot, 0);
        assert_eq!(graph.node(a).unwrap().outputs()[0].links(), &[y]);
    }

    struct Stubborn;

    impl NodeBehavior for Stubborn {
        fn on_property_changed(&mut self, name: &str, _value: &Value) -> bool {
            name == "locked"
        }
    }

    #[test]
    fn test_set_property_respects_keep_old() {
        let mut graph = Graph::default();
        let id = graph
            .add(
                Node::new("test/props")
                    .with_property("locked", 1)
                    .with_property("free", 1)
                    .with_behavior(Stubborn),
            )
            .unwrap();
        assert!(graph.set_property(id, "locked", 2));
        assert!(graph.set_property(id, "free", 2));
        let node = graph.node(id).unwrap();
        assert_eq!(node.property("locked"), Some(&json!(1)));
        assert_eq!(node.property("free"), Some(&json!(2)));
        assert!(!graph.set_property(NodeId(42), "free", 3));
    }

    #[test]
    fn test_version_bumps_on_mutation() {
        let mut graph = Graph::default();
        let v0 = graph.version();
        let a = graph.add(number_node()).unwrap();
        let b = graph.add(number_node()).unwrap();
        let v1 = graph.version();
        assert!(v1 > v0);
        graph.connect(a, 0, b, 0).unwrap();
        let v2 = graph.version();
        assert!(v2 > v1);
        graph.set_position(a, 10.0, 10.0);
        assert!(graph.version() > v2);
    }

    #[test]
    fn test_unknown_type_becomes_placeholder() {
        let mut graph = Graph::default();
        let id = graph.add_new("missing/Kind").unwrap();
        let node = graph.node(id).unwrap();
        assert!(node.has_errors());
        assert_eq!(node.node_type(), "missing/Kind");
    }

    #[test]
    fn test_find_node_by_title() {
        let mut graph = Graph::default();
        let a = graph.add(number_node()).unwrap();
        let b = graph.add(number_node()).unwrap();
        graph.set_title(b, "Gain");

        let found = {
            let title = String::from("Gain");
            graph.find_node_by_title(&title)
        };
        assert_eq!(found.and_then(Node::id), Some(b));
        assert!(graph.find_node_by_title("Missing").is_none());

        graph.set_title(a, "Gain");
        assert_eq!(graph.find_node_by_title("Gain").and_then(Node::id), Some(a));
        assert_eq!(graph.find_nodes_by_title("Gain").count(), 2);
    }

    #[test]
    fn test_hit_testing() {
        let mut graph = Graph::default();
        let a = graph.add(number_node().with_position(0.0, 0.0)).unwrap();
        let b = graph.add(number_node().with_position(50.0, 0.0)).unwrap();
        graph.set_size(a, 100.0, 40.0);
        graph.set_size(b, 100.0, 40.0);

        assert_eq!(graph.node_on_pos(60.0, 10.0, 0.0), Some(b));
        assert_eq!(graph.node_on_pos(20.0, 10.0, 0.0), Some(a));
        assert_eq!(graph.node_on_pos(500.0, 500.0, 0.0), None);

        graph.add_group(Group::new("back").with_bounding([-50.0, -50.0, 400.0, 400.0]));
        graph.add_group(Group::new("front").with_bounding([40.0, -30.0, 30.0, 30.0]));
        assert_eq!(graph.group_on_pos(45.0, -20.0), Some(1));
        assert_eq!(graph.group_on_pos(300.0, 300.0), Some(0));
        assert_eq!(graph.nodes_in_group(0), vec![a, b]);
    }

    #[test]
    fn test_align_to_grid_on_add() {
        let mut graph = Graph::default();
        graph.settings_mut().align_to_grid = true;
        let id = graph.add(number_node().with_position(13.0, 27.0)).unwrap();
        assert_eq!(graph.node(id).unwrap().pos(), [10.0, 30.0]);
    }

    #[test]
    fn test_clear_notifies_and_resets() {
        let log = Rc::new(RefCell::new(ChangeLog::default()));
        let mut graph = Graph::default();
        graph
            .add(number_node().with_behavior(Recorder(Rc::clone(&log))))
            .unwrap();
        graph.add_group(Group::new("g"));
        graph.clear();
        assert_eq!(graph.node_count(), 0);
        assert!(graph.groups().is_empty());
        assert_eq!(log.borrow().events, vec!["removed"]);
        assert_eq!(graph.add(number_node()).unwrap(), NodeId(1));
    }
}
