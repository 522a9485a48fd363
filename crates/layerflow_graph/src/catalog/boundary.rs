// SPDX-License-Identifier: MIT OR Apache-2.0
//! Nodes that move values across the graph boundary.
//!
//! `graph/input` declares a global input named by its `name` property and
//! publishes its value each tick; `graph/output` writes what reaches it into
//! the global output of that name. Renaming the property renames the global
//! on the next tick.

use crate::boundary::GlobalSlot;
use crate::execution::{NodeContext, NodeError};
use crate::graph::Graph;
use crate::node::{NodeBehavior, NodeId};
use crate::port::{Direction, SlotType};
use crate::registry::{NodeRegistry, NodeType};
use indexmap::IndexMap;
use serde_json::Value;

/// Register the boundary kinds
pub fn register(registry: &mut NodeRegistry) {
    registry.register(
        NodeType::new("graph/input", "Input")
            .with_description("Input of the graph")
            .with_output("value", SlotType::Any)
            .with_attribute("name", "")
            .with_attribute("type", "*")
            .with_behavior(|| BoundaryBridge::new(Direction::Input)),
    );

    registry.register(
        NodeType::new("graph/output", "Output")
            .with_description("Output of the graph")
            .with_input("value", SlotType::Any)
            .with_attribute("name", "")
            .with_attribute("type", "*")
            .with_behavior(|| BoundaryBridge::new(Direction::Output)),
    );
}

/// Keeps one global boundary port in step with a node's `name` and `type`
#[derive(Debug)]
pub struct BoundaryBridge {
    direction: Direction,
    registered: Option<String>,
}

impl BoundaryBridge {
    /// Bridge for a global input or output
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            registered: None,
        }
    }

    fn wanted(&self, graph: &Graph, id: NodeId) -> Option<(String, SlotType)> {
        let node = graph.node(id)?;
        let name = node.property("name").and_then(Value::as_str).unwrap_or_default();
        let slot_type = node
            .property("type")
            .and_then(Value::as_str)
            .map_or(SlotType::Any, SlotType::from);
        Some((name.to_string(), slot_type))
    }

    fn sync(&mut self, graph: &mut Graph, id: NodeId) {
        let Some((mut name, slot_type)) = self.wanted(graph, id) else {
            return;
        };
        if name.is_empty() {
            let prefix = match self.direction {
                Direction::Input => "input",
                Direction::Output => "output",
            };
            name = format!("{prefix}_{}", id.0);
            graph.store_property(id, "name", Value::String(name.clone()));
        }

        let direction = self.direction;
        if let Some(old) = self.registered.take() {
            if old != name && !rename(graph, direction, &old, &name) {
                tracing::warn!("Could not rename global {direction:?} {old} to {name}");
            }
        }
        if !globals(graph, direction).contains_key(&name) {
            match direction {
                Direction::Input => graph.add_global_input(&name, slot_type.clone(), None),
                Direction::Output => graph.add_global_output(&name, slot_type.clone(), None),
            }
        }
        match direction {
            Direction::Input => graph.change_global_input_type(&name, slot_type),
            Direction::Output => graph.change_global_output_type(&name, slot_type),
        };

        if let Some(node) = graph.node_mut(id) {
            let slot = match direction {
                Direction::Input => node.outputs.first_mut().map(|slot| &mut slot.name),
                Direction::Output => node.inputs.first_mut().map(|slot| &mut slot.name),
            };
            if let Some(slot_name) = slot {
                slot_name.clone_from(&name);
            }
        }
        self.registered = Some(name);
    }
}

fn globals(graph: &Graph, direction: Direction) -> &IndexMap<String, GlobalSlot> {
    match direction {
        Direction::Input => graph.global_inputs(),
        Direction::Output => graph.global_outputs(),
    }
}

fn rename(graph: &mut Graph, direction: Direction, old: &str, new: &str) -> bool {
    match direction {
        Direction::Input => graph.rename_global_input(old, new),
        Direction::Output => graph.rename_global_output(old, new),
    }
}

impl NodeBehavior for BoundaryBridge {
    fn can_execute(&self) -> bool {
        true
    }

    fn on_added(&mut self, graph: &mut Graph, id: NodeId) {
        self.sync(graph, id);
    }

    fn execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let id = ctx.id();
        self.sync(ctx.graph_mut(), id);
        let Some(name) = self.registered.clone() else {
            return Ok(());
        };

        match self.direction {
            Direction::Input => {
                if let Some(value) = ctx.graph().global_input_data(&name).cloned() {
                    ctx.set_output_data(0, value);
                }
            }
            Direction::Output => {
                if let Some(value) = ctx.get_input_data(0).cloned() {
                    ctx.graph_mut().set_global_output_data(&name, value);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::standard_registry;
    use crate::graph::Graph;
    use crate::snapshot::Snapshot;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_value_crosses_the_graph() {
        let mut graph = Graph::new(Arc::new(standard_registry()));
        let input = graph.add_new("graph/input").unwrap();
        let output = graph.add_new("graph/output").unwrap();
        graph.connect(input, 0, output, 0).unwrap();

        let in_name = format!("input_{}", input.0);
        let out_name = format!("output_{}", output.0);
        assert!(graph.global_inputs().contains_key(&in_name));
        assert!(graph.global_outputs().contains_key(&out_name));

        assert!(graph.set_global_input_data(&in_name, json!([1, 3, 32, 32])));
        graph.run_step(1, true).unwrap();
        assert_eq!(graph.global_output_data(&out_name), Some(&json!([1, 3, 32, 32])));
    }

    #[test]
    fn test_rename_follows_property() {
        let mut graph = Graph::new(Arc::new(standard_registry()));
        let input = graph.add_new("graph/input").unwrap();
        graph.set_property(input, "name", "image");
        graph.run_step(1, true).unwrap();

        let names: Vec<_> = graph.global_inputs().keys().cloned().collect();
        assert_eq!(names, vec!["image"]);
        assert_eq!(graph.node(input).unwrap().outputs()[0].name, "image");
    }

    #[test]
    fn test_loaded_input_keeps_its_name() {
        let mut graph = Graph::new(Arc::new(standard_registry()));
        let input = graph.add_new("graph/input").unwrap();
        graph.set_property(input, "name", "image");
        graph.set_property(input, "type", "tensor");
        graph.run_step(1, true).unwrap();
        let snapshot = Snapshot::from_json(&graph.serialize().to_json().unwrap()).unwrap();

        let mut loaded = Graph::new(Arc::new(standard_registry()));
        loaded.configure(&snapshot, false);
        loaded.run_step(1, true).unwrap();
        let slot = &loaded.global_inputs()["image"];
        assert_eq!(slot.slot_type.to_string(), "tensor");
        assert_eq!(loaded.global_inputs().len(), 1);
    }
}
