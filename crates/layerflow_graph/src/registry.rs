// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node type descriptors and the registry that instantiates them.
//!
//! Creating a node is two explicit steps: [`NodeType::instantiate`] builds a
//! raw descriptor-bound node, then [`Node::attach_defaults`] fills in title,
//! properties, geometry and mode. [`NodeRegistry::create`] runs both.

use crate::node::{Inert, Node, NodeBehavior, NodeMode};
use crate::port::{InputSlot, OutputSlot, SlotType};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Constructor for the behavior of a node kind
pub type BehaviorFactory = Arc<dyn Fn() -> Box<dyn NodeBehavior> + Send + Sync>;

/// Declared configuration attribute of a node kind
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Property name
    pub name: String,
    /// Initial value, an empty string when absent
    pub default: Option<Value>,
    /// Whether inspectors should show it
    pub visible: bool,
}

/// Node type definition
#[derive(Clone)]
pub struct NodeType {
    /// Unique type identifier, `category/name`
    pub id: String,
    /// Default title
    pub title: String,
    /// Description
    pub description: String,
    /// Default input slots
    pub inputs: Vec<InputSlot>,
    /// Default output slots
    pub outputs: Vec<OutputSlot>,
    /// Configuration attributes seeded into the property bag
    pub attributes: Vec<Attribute>,
    /// Initial execution mode
    pub mode: NodeMode,
    /// Ordering priority shared by every instance (instances may override)
    pub priority: i32,
    /// Fixed size, computed from the slots when `None`
    pub size: Option<[f32; 2]>,
    behavior: BehaviorFactory,
}

impl NodeType {
    /// Create a descriptor with no slots and no capabilities
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: Vec::new(),
            mode: NodeMode::Always,
            priority: 0,
            size: None,
            behavior: Arc::new(|| Box::new(Inert)),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a default input slot
    pub fn with_input(mut self, name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        self.inputs.push(InputSlot::new(name, slot_type));
        self
    }

    /// Add a default output slot
    pub fn with_output(mut self, name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        self.outputs.push(OutputSlot::new(name, slot_type));
        self
    }

    /// Declare a visible attribute with a default value
    pub fn with_attribute(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            default: Some(default.into()),
            visible: true,
        });
        self
    }

    /// Declare a hidden attribute without a default
    pub fn with_hidden_attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            default: None,
            visible: false,
        });
        self
    }

    /// Declare a hidden attribute that still starts with a value
    pub fn with_hidden_default(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            default: Some(default.into()),
            visible: false,
        });
        self
    }

    /// Set the initial execution mode
    pub fn with_mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the ordering priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Use a fixed size instead of computing one
    pub fn with_size(mut self, width: f32, height: f32) -> Self {
        self.size = Some([width, height]);
        self
    }

    /// Give instances a behavior
    pub fn with_behavior<F, B>(mut self, constructor: F) -> Self
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: NodeBehavior + 'static,
    {
        self.behavior = Arc::new(move || Box::new(constructor()));
        self
    }

    /// Category part of the identifier (text before the last `/`)
    pub fn category(&self) -> &str {
        self.id.rsplit_once('/').map_or("", |(category, _)| category)
    }

    /// Build a raw node bound to this descriptor. Defaults are not applied.
    pub fn instantiate(&self, title: Option<&str>) -> Node {
        let mut node = Node::new(self.id.clone());
        node.title = title.unwrap_or_default().to_string();
        node.inputs = self.inputs.clone();
        node.outputs = self.outputs.clone();
        node.mode = self.mode;
        node.set_behavior((self.behavior)());
        node
    }
}

impl fmt::Debug for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeType")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("attributes", &self.attributes)
            .field("mode", &self.mode)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Error when creating a node
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No descriptor with this identifier
    #[error("Node type not registered: {0}")]
    UnknownType(String),
}

/// Registry of available node types
#[derive(Debug, Default)]
pub struct NodeRegistry {
    /// Registered node types by ID
    types: IndexMap<String, NodeType>,
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node type, replacing any previous one with the same ID
    pub fn register(&mut self, node_type: NodeType) -> Option<NodeType> {
        tracing::debug!("Node type registered: {}", node_type.id);
        let previous = self.types.insert(node_type.id.clone(), node_type);
        if let Some(previous) = &previous {
            tracing::warn!("Node type {} registered twice, replacing", previous.id);
        }
        previous
    }

    /// Remove a node type
    pub fn unregister(&mut self, id: &str) -> Option<NodeType> {
        self.types.shift_remove(id)
    }

    /// Get a node type by ID
    pub fn get(&self, id: &str) -> Option<&NodeType> {
        self.types.get(id)
    }

    /// Whether a type is registered
    pub fn contains(&self, id: &str) -> bool {
        self.types.contains_key(id)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Get all registered types
    pub fn types(&self) -> impl Iterator<Item = &NodeType> {
        self.types.values()
    }

    /// Get types by category; `""` selects uncategorised types
    pub fn types_in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a NodeType> {
        self.types.values().filter(move |t| t.category() == category)
    }

    /// Sorted list of categories in use
    pub fn categories(&self) -> Vec<String> {
        self.types
            .values()
            .map(|t| t.category().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Create an unattached node from a type ID
    pub fn create(&self, type_id: &str, title: Option<&str>) -> Result<Node, RegistryError> {
        let descriptor = self
            .get(type_id)
            .ok_or_else(|| RegistryError::UnknownType(type_id.to_string()))?;
        let mut node = descriptor.instantiate(title);
        node.attach_defaults(descriptor);
        Ok(node)
    }
}
