// SPDX-License-Identifier: MIT OR Apache-2.0
//! Constants, arithmetic and value inspection.

use super::as_number;
use crate::execution::{NodeContext, NodeError};
use crate::node::NodeBehavior;
use crate::port::SlotType;
use crate::registry::{NodeRegistry, NodeType};
use serde_json::Value;

/// Register the basic kinds
pub fn register(registry: &mut NodeRegistry) {
    registry.register(
        NodeType::new("basic/const_number", "Const Number")
            .with_description("Constant number")
            .with_output("value", "number")
            .with_attribute("value", 1.0)
            .with_behavior(|| ConstNumber),
    );

    registry.register(
        NodeType::new("basic/watch", "Watch")
            .with_description("Show value of input")
            .with_input("value", SlotType::Any)
            .with_size(60.0, 20.0)
            .with_behavior(|| Watch),
    );

    registry.register(
        NodeType::new("basic/sum", "Sum")
            .with_description("Add two numbers")
            .with_input("A", "number")
            .with_input("B", "number")
            .with_output("A+B", "number")
            .with_attribute("A", 0.0)
            .with_attribute("B", 0.0)
            .with_behavior(|| Sum),
    );
}

/// Writes its `value` property to its output every tick
#[derive(Debug, Default)]
pub struct ConstNumber;

impl NodeBehavior for ConstNumber {
    fn can_execute(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let value = match ctx.property("value") {
            Some(value) => as_number("value", value)?,
            None => 0.0,
        };
        ctx.set_output_data(0, value);
        Ok(())
    }
}

/// Keeps the last value seen on its input in the `value` property
#[derive(Debug, Default)]
pub struct Watch;

impl NodeBehavior for Watch {
    fn can_execute(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let value = ctx.get_input_data(0).cloned().unwrap_or(Value::Null);
        if ctx.property("value") != Some(&value) {
            ctx.set_property("value", value);
        }
        Ok(())
    }
}

/// `A + B`, each side falling back to the property of the same name
#[derive(Debug, Default)]
pub struct Sum;

impl NodeBehavior for Sum {
    fn can_execute(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let mut total = 0.0;
        for name in ["A", "B"] {
            if let Some(value) = ctx.get_input_or_property(name) {
                total += as_number(name, value)?;
            }
        }
        ctx.set_output_data(0, total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::standard_registry;
    use crate::graph::Graph;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_const_into_watch() {
        let mut graph = Graph::new(Arc::new(standard_registry()));
        let constant = graph.add_new("basic/const_number").unwrap();
        let watch = graph.add_new("basic/watch").unwrap();
        graph.connect(constant, 0, watch, 0).unwrap();
        graph.set_property(constant, "value", 4.5);

        graph.run_step(1, true).unwrap();
        assert_eq!(graph.node(watch).unwrap().property("value"), Some(&json!(4.5)));
    }

    #[test]
    fn test_watch_unchanged_value_keeps_version() {
        let mut graph = Graph::new(Arc::new(standard_registry()));
        let constant = graph.add_new("basic/const_number").unwrap();
        let watch = graph.add_new("basic/watch").unwrap();
        graph.connect(constant, 0, watch, 0).unwrap();

        graph.run_step(1, true).unwrap();
        let version = graph.version();
        graph.run_step(3, true).unwrap();
        assert_eq!(graph.version(), version);
    }

    #[test]
    fn test_sum_mixes_inputs_and_properties() {
        let mut graph = Graph::new(Arc::new(standard_registry()));
        let constant = graph.add_new("basic/const_number").unwrap();
        let sum = graph.add_new("basic/sum").unwrap();
        graph.connect(constant, 0, sum, 0).unwrap();
        graph.set_property(constant, "value", 2.0);
        graph.set_property(sum, "B", "0.5");

        graph.run_step(1, true).unwrap();
        assert_eq!(graph.get_output_data(sum, 0), Some(&json!(2.5)));
    }

    #[test]
    fn test_bad_property_fails_the_step() {
        let mut graph = Graph::new(Arc::new(standard_registry()));
        let constant = graph.add_new("basic/const_number").unwrap();
        graph.set_property(constant, "value", "abc");
        assert!(graph.run_step(1, true).is_err());
    }
}
