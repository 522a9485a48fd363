// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node definitions for the graph framework.
//!
//! A [`Node`] is plain data (ports, properties, geometry) plus an optional
//! boxed [`NodeBehavior`] carrying the capabilities of its kind. Nodes never
//! hold references to their graph or to each other; everything is addressed
//! by [`NodeId`] through the owning [`Graph`](crate::Graph).

use crate::execution::{NodeContext, NodeError};
use crate::graph::Graph;
use crate::link::Link;
use crate::port::{Direction, InputSlot, OutputSlot, SlotType};
use crate::registry::NodeType;
use crate::snapshot::NodeRecord;
use crate::style;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Unique identifier for a node within one graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// When the per-tick scan runs a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeMode {
    /// Executed on every tick
    #[default]
    Always,
    /// Only reacts to events
    OnEvent,
    /// Never executed
    Never,
    /// Executed when an event link reaches it
    OnTrigger,
}

impl From<NodeMode> for u8 {
    fn from(mode: NodeMode) -> Self {
        match mode {
            NodeMode::Always => 0,
            NodeMode::OnEvent => 1,
            NodeMode::Never => 2,
            NodeMode::OnTrigger => 3,
        }
    }
}

impl TryFrom<u8> for NodeMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Always),
            1 => Ok(Self::OnEvent),
            2 => Ok(Self::Never),
            3 => Ok(Self::OnTrigger),
            other => Err(format!("unknown node mode {other}")),
        }
    }
}

/// Per-node UI flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Drawn as a title bar only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub collapsed: bool,
    /// Cannot be dragged
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,
}

/// Declared property metadata (for inspectors)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyInfo {
    /// Property name
    pub name: String,
    /// Optional type hint ("number", "vec3", ...)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Value the property starts with
    pub default_value: Value,
}

/// A connection change reported to both endpoints of a link
#[derive(Debug, Clone)]
pub struct ConnectionChange {
    /// Which side of the receiving node changed
    pub direction: Direction,
    /// Slot index on the receiving node
    pub slot: usize,
    /// `true` for a new link, `false` for a removed one
    pub connected: bool,
    /// The link involved
    pub link: Link,
    /// Name of the slot on the receiving node
    pub slot_name: String,
}

/// Optional capabilities of a node kind.
///
/// Every member has a no-op default. A kind that executes must return `true`
/// from [`can_execute`](Self::can_execute); one that handles event links must
/// return `true` from [`accepts_actions`](Self::accepts_actions).
pub trait NodeBehavior {
    /// Whether [`execute`](Self::execute) does anything. Drives the cached executable list.
    fn can_execute(&self) -> bool {
        false
    }

    /// Run the node body
    fn execute(&mut self, _ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        Ok(())
    }

    /// Whether [`on_action`](Self::on_action) handles incoming events
    fn accepts_actions(&self) -> bool {
        false
    }

    /// Handle an event arriving on the input named `action`
    fn on_action(
        &mut self,
        _ctx: &mut NodeContext<'_>,
        _action: &str,
        _payload: &Value,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    /// Called once the node is stored in a graph and has an ID
    fn on_added(&mut self, _graph: &mut Graph, _id: NodeId) {}

    /// Called after the node's links are gone, right before it leaves the graph
    fn on_removed(&mut self) {}

    /// The graph started running
    fn on_start(&mut self) {}

    /// The graph stopped running
    fn on_stop(&mut self) {}

    /// A link was made or broken on one of this node's slots
    fn on_connections_change(&mut self, _change: &ConnectionChange) {}

    /// Return `false` to refuse an incoming link of `output_type` on `slot`
    fn on_connect_input(&mut self, _slot: usize, _output_type: &SlotType) -> bool {
        true
    }

    /// A property is about to change. Return `true` to keep the old value.
    fn on_property_changed(&mut self, _name: &str, _value: &Value) -> bool {
        false
    }

    /// The node was configured from a snapshot record
    fn on_configure(&mut self, _record: &NodeRecord) {}

    /// Add extra data to the node's snapshot record
    fn on_serialize(&self, _record: &mut NodeRecord) {}
}

/// Behavior with no capabilities, used for bare and placeholder nodes
#[derive(Debug, Default)]
pub struct Inert;

impl NodeBehavior for Inert {}

/// Cached answers of the capability queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Capabilities {
    pub(crate) execute: bool,
    pub(crate) actions: bool,
}

impl Capabilities {
    fn of(behavior: &dyn NodeBehavior) -> Self {
        Self {
            execute: behavior.can_execute(),
            actions: behavior.accepts_actions(),
        }
    }
}

/// A node instance
pub struct Node {
    pub(crate) id: Option<NodeId>,
    pub(crate) node_type: String,
    pub(crate) title: String,
    pub(crate) type_title: String,
    pub(crate) pos: [f32; 2],
    pub(crate) size: [f32; 2],
    pub(crate) flags: NodeFlags,
    pub(crate) mode: NodeMode,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) outputs: Vec<OutputSlot>,
    pub(crate) properties: IndexMap<String, Value>,
    pub(crate) properties_info: Vec<PropertyInfo>,
    pub(crate) color: Option<String>,
    pub(crate) bgcolor: Option<String>,
    pub(crate) shape: Option<String>,
    pub(crate) priority: Option<i32>,
    pub(crate) kind_priority: i32,
    pub(crate) order: usize,
    pub(crate) has_errors: bool,
    pub(crate) last_serialization: Option<NodeRecord>,
    pub(crate) capabilities: Capabilities,
    /// Taken out while the node runs so the body can borrow the graph.
    pub(crate) behavior: Option<Box<dyn NodeBehavior>>,
}

impl Node {
    /// Create a bare, unattached node of the given type with no ports
    pub fn new(node_type: impl Into<String>) -> Self {
        let node_type = node_type.into();
        Self {
            id: None,
            title: String::new(),
            type_title: node_type.clone(),
            node_type,
            pos: [0.0, 0.0],
            size: [0.0, 0.0],
            flags: NodeFlags::default(),
            mode: NodeMode::Always,
            inputs: Vec::new(),
            outputs: Vec::new(),
            properties: IndexMap::new(),
            properties_info: Vec::new(),
            color: None,
            bgcolor: None,
            shape: None,
            priority: None,
            kind_priority: 0,
            order: 0,
            has_errors: false,
            last_serialization: None,
            capabilities: Capabilities::default(),
            behavior: Some(Box::new(Inert)),
        }
    }

    /// Stand-in for a node whose type could not be created.
    ///
    /// It keeps the raw record and hands it back unchanged when serialized.
    pub fn placeholder(record: NodeRecord) -> Self {
        let mut node = Self::new(record.node_type.clone());
        node.title = record.title.clone().unwrap_or_else(|| record.node_type.clone());
        node.has_errors = true;
        node.last_serialization = Some(record);
        node
    }

    /// Fill everything the descriptor-bound constructor left unset
    pub fn attach_defaults(&mut self, descriptor: &NodeType) {
        if self.title.is_empty() {
            self.title = descriptor.title.clone();
        }
        self.type_title = descriptor.title.clone();
        if self.properties.is_empty() {
            for attribute in &descriptor.attributes {
                let value = attribute.default.clone().unwrap_or_else(|| Value::String(String::new()));
                self.properties.insert(attribute.name.clone(), value);
            }
        }
        if self.size == [0.0, 0.0] {
            self.size = descriptor.size.unwrap_or_else(|| self.compute_size());
        }
        if self.pos == [0.0, 0.0] {
            self.pos = style::DEFAULT_POSITION;
        }
        self.mode = descriptor.mode;
        self.kind_priority = descriptor.priority;
    }

    /// Set the title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Append an input slot
    pub fn with_input(mut self, name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        self.add_input(name, slot_type);
        self
    }

    /// Append an output slot
    pub fn with_output(mut self, name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        self.add_output(name, slot_type);
        self
    }

    /// Set a property value
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Set the execution mode
    pub fn with_mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the priority of this instance
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the position
    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.pos = [x, y];
        self
    }

    /// Attach the capabilities of this node
    pub fn with_behavior(mut self, behavior: impl NodeBehavior + 'static) -> Self {
        self.set_behavior(Box::new(behavior));
        self
    }

    pub(crate) fn set_behavior(&mut self, behavior: Box<dyn NodeBehavior>) {
        self.capabilities = Capabilities::of(behavior.as_ref());
        self.behavior = Some(behavior);
    }

    /// Append an input slot and return its index
    pub fn add_input(&mut self, name: impl Into<String>, slot_type: impl Into<SlotType>) -> usize {
        self.inputs.push(InputSlot::new(name, slot_type));
        self.size = self.compute_size();
        self.inputs.len() - 1
    }

    /// Append an output slot and return its index
    pub fn add_output(&mut self, name: impl Into<String>, slot_type: impl Into<SlotType>) -> usize {
        self.outputs.push(OutputSlot::new(name, slot_type));
        self.size = self.compute_size();
        self.outputs.len() - 1
    }

    /// Declare a property with metadata and seed its value
    pub fn add_property(
        &mut self,
        name: impl Into<String>,
        default_value: impl Into<Value>,
        kind: Option<&str>,
    ) -> &PropertyInfo {
        let name = name.into();
        let default_value = default_value.into();
        self.properties.insert(name.clone(), default_value.clone());
        self.properties_info.push(PropertyInfo {
            name,
            kind: kind.map(str::to_string),
            default_value,
        });
        &self.properties_info[self.properties_info.len() - 1]
    }

    /// Graph-assigned ID, `None` while unattached
    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    /// Registry type identifier
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// Category part of the type identifier (text before the last `/`)
    pub fn category(&self) -> &str {
        self.node_type.rsplit_once('/').map_or("", |(category, _)| category)
    }

    /// Display title
    pub fn title(&self) -> &str {
        if self.title.is_empty() {
            &self.type_title
        } else {
            &self.title
        }
    }

    /// Position of the top-left corner of the body
    pub fn pos(&self) -> [f32; 2] {
        self.pos
    }

    /// Body size
    pub fn size(&self) -> [f32; 2] {
        self.size
    }

    /// UI flags
    pub fn flags(&self) -> &NodeFlags {
        &self.flags
    }

    /// Execution mode
    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    /// Input slots
    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    /// Output slots
    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    /// Get an input slot by index
    pub fn input(&self, slot: usize) -> Option<&InputSlot> {
        self.inputs.get(slot)
    }

    /// Get an output slot by index
    pub fn output(&self, slot: usize) -> Option<&OutputSlot> {
        self.outputs.get(slot)
    }

    /// Index of the input with this name
    pub fn find_input_slot(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|slot| slot.name == name)
    }

    /// Index of the output with this name
    pub fn find_output_slot(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|slot| slot.name == name)
    }

    /// Whether any output has a link
    pub fn is_any_output_connected(&self) -> bool {
        self.outputs.iter().any(OutputSlot::is_connected)
    }

    /// Property values
    pub fn properties(&self) -> &IndexMap<String, Value> {
        &self.properties
    }

    /// Get a property value
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Declared property metadata
    pub fn properties_info(&self) -> &[PropertyInfo] {
        &self.properties_info
    }

    /// Custom title color
    pub fn color(&self) -> Option<&str> {
        self.color.as_deref()
    }

    /// Custom body color
    pub fn bgcolor(&self) -> Option<&str> {
        self.bgcolor.as_deref()
    }

    /// Custom shape name
    pub fn shape(&self) -> Option<&str> {
        self.shape.as_deref()
    }

    /// Instance priority if overridden, otherwise the kind default
    pub fn priority(&self) -> i32 {
        self.priority.unwrap_or(self.kind_priority)
    }

    /// Position in the last computed execution order
    pub fn order(&self) -> usize {
        self.order
    }

    /// Set when the node stands in for a type that failed to load
    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    /// Whether the node has an execute body
    pub fn can_execute(&self) -> bool {
        self.capabilities.execute
    }

    /// Whether the node handles incoming events itself
    pub fn accepts_actions(&self) -> bool {
        self.capabilities.actions
    }

    /// Size needed to fit the title and slot labels
    pub fn compute_size(&self) -> [f32; 2] {
        let rows = self.inputs.len().max(self.outputs.len()).max(1) as f32;
        let height = rows * (style::NODE_TEXT_SIZE + 1.0) + 4.0;

        let text_width = |text: &str| style::NODE_TEXT_SIZE * text.chars().count() as f32 * 0.6;
        let title_width = text_width(self.title());
        let input_width = self
            .inputs
            .iter()
            .map(|slot| text_width(slot.display_name()))
            .fold(0.0, f32::max);
        let output_width = self
            .outputs
            .iter()
            .map(|slot| text_width(slot.display_name()))
            .fold(0.0, f32::max);

        let width = (input_width + output_width + 10.0)
            .max(title_width)
            .max(style::NODE_WIDTH);
        [width, height]
    }

    /// Bounding box `[x, y, width, height]` including the title bar
    pub fn bounding(&self) -> [f32; 4] {
        [
            self.pos[0] - 4.0,
            self.pos[1] - style::NODE_TITLE_HEIGHT,
            self.size[0] + 4.0,
            self.size[1] + style::NODE_TITLE_HEIGHT,
        ]
    }

    /// Hit test in graph space
    pub fn is_point_inside(&self, x: f32, y: f32, margin: f32) -> bool {
        if self.flags.collapsed {
            return style::is_inside_rectangle(
                x,
                y,
                self.pos[0] - margin,
                self.pos[1] - style::NODE_TITLE_HEIGHT - margin,
                style::NODE_COLLAPSED_WIDTH + 2.0 * margin,
                style::NODE_TITLE_HEIGHT + 2.0 * margin,
            );
        }
        (self.pos[0] - 4.0 - margin) < x
            && (self.pos[0] + self.size[0] + 4.0 + margin) > x
            && (self.pos[1] - style::NODE_TITLE_HEIGHT - margin) < y
            && (self.pos[1] + self.size[1] + margin) > y
    }

    /// Where a link attaches to a slot, in graph space
    pub fn connection_pos(&self, is_input: bool, slot: usize) -> [f32; 2] {
        if self.flags.collapsed {
            let x = if is_input {
                self.pos[0]
            } else {
                self.pos[0] + style::NODE_COLLAPSED_WIDTH
            };
            return [x, self.pos[1] - style::NODE_TITLE_HEIGHT * 0.5];
        }
        let x = if is_input {
            self.pos[0]
        } else {
            self.pos[0] + self.size[0] + 1.0
        };
        [x, self.pos[1] + 10.0 + slot as f32 * style::NODE_SLOT_HEIGHT]
    }

    /// Snap the position to the grid
    pub fn align_to_grid(&mut self, grid_size: f32) {
        if grid_size <= 0.0 {
            return;
        }
        self.pos[0] = grid_size * (self.pos[0] / grid_size).round();
        self.pos[1] = grid_size * (self.pos[1] / grid_size).round();
    }

    /// Overwrite state from a snapshot record.
    ///
    /// Slot link references are taken as recorded; the owning graph repairs
    /// them. `on_configure` is left to the caller.
    pub(crate) fn apply_record(&mut self, record: &NodeRecord) {
        for (name, value) in &record.properties {
            let keep_old = self
                .behavior
                .as_mut()
                .is_some_and(|behavior| behavior.on_property_changed(name, value));
            if !keep_old {
                self.properties.insert(name.clone(), value.clone());
            }
        }
        if let Some(inputs) = &record.inputs {
            self.inputs = inputs.clone();
        }
        if let Some(outputs) = &record.outputs {
            self.outputs = outputs.clone();
        }
        self.flags = record.flags.clone();
        if let Some(mode) = record.mode {
            self.mode = mode;
        }
        self.title = record.title.clone().unwrap_or_default();
        if let Some(pos) = record.pos {
            self.pos = pos;
        }
        match record.size {
            Some(size) => self.size = size,
            None if record.inputs.is_some() || record.outputs.is_some() => {
                self.size = self.compute_size();
            }
            None => {}
        }
        self.color = record.color.clone();
        self.bgcolor = record.bgcolor.clone();
        self.shape = record.shape.clone();
        self.priority = record.priority;
    }

    /// Snapshot record for this node
    pub fn serialize(&self) -> NodeRecord {
        if let Some(raw) = &self.last_serialization {
            let mut raw = raw.clone();
            if self.id.is_some() {
                raw.id = self.id;
            }
            // link references follow the live slots, which the graph keeps repaired
            for (slot, input) in raw.inputs.iter_mut().flatten().enumerate() {
                input.link = self.inputs.get(slot).and_then(|live| live.link);
            }
            for (slot, output) in raw.outputs.iter_mut().flatten().enumerate() {
                output.links = self.outputs.get(slot).map(|live| live.links.clone()).unwrap_or_default();
            }
            return raw;
        }

        let mut outputs = self.outputs.clone();
        for output in &mut outputs {
            output.data = None;
        }

        let mut record = NodeRecord {
            id: self.id,
            node_type: self.node_type.clone(),
            pos: Some(self.pos),
            size: Some(self.size),
            flags: self.flags.clone(),
            mode: Some(self.mode),
            inputs: Some(self.inputs.clone()),
            outputs: Some(outputs),
            title: (!self.title.is_empty() && self.title != self.type_title).then(|| self.title.clone()),
            properties: self.properties.clone(),
            color: self.color.clone(),
            bgcolor: self.bgcolor.clone(),
            shape: self.shape.clone(),
            priority: self.priority,
            extra: IndexMap::new(),
        };
        if let Some(behavior) = &self.behavior {
            behavior.on_serialize(&mut record);
        }
        record
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .field("title", &self.title())
            .field("mode", &self.mode)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("properties", &self.properties)
            .field("order", &self.order)
            .field("has_errors", &self.has_errors)
            .finish_non_exhaustive()
    }
}
