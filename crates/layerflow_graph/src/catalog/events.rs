// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event sources and sinks.

use super::as_number;
use crate::execution::{NodeContext, NodeError};
use crate::node::{NodeBehavior, NodeMode};
use crate::port::SlotType;
use crate::registry::{NodeRegistry, NodeType};
use serde_json::{json, Value};

/// Register the event kinds
pub fn register(registry: &mut NodeRegistry) {
    registry.register(
        NodeType::new("events/emitter", "Emitter")
            .with_description("Fires an event every tick")
            .with_output("on_tick", SlotType::Event)
            .with_behavior(|| Emitter),
    );

    registry.register(
        NodeType::new("events/counter", "Counter")
            .with_description("Counts incoming events")
            .with_input("inc", SlotType::Event)
            .with_input("reset", SlotType::Event)
            .with_output("count", "number")
            .with_attribute("count", 0)
            .with_behavior(|| Counter),
    );

    registry.register(
        NodeType::new("events/log", "Log")
            .with_description("Records every payload it is triggered with")
            .with_input("event", SlotType::Event)
            .with_mode(NodeMode::OnTrigger)
            .with_attribute("entries", json!([]))
            .with_behavior(|| Log),
    );
}

/// Triggers its event output with the iteration number
#[derive(Debug, Default)]
pub struct Emitter;

impl NodeBehavior for Emitter {
    fn can_execute(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let iteration = ctx.graph().iteration();
        ctx.trigger_slot(0, json!(iteration), None)?;
        Ok(())
    }
}

/// Counts `inc` actions, `reset` sets it back to zero
#[derive(Debug, Default)]
pub struct Counter;

impl NodeBehavior for Counter {
    fn can_execute(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let count = ctx.property("count").cloned().unwrap_or(json!(0));
        ctx.set_output_data(0, count);
        Ok(())
    }

    fn accepts_actions(&self) -> bool {
        true
    }

    fn on_action(&mut self, ctx: &mut NodeContext<'_>, action: &str, _payload: &Value) -> Result<(), NodeError> {
        let count = match ctx.property("count") {
            Some(value) => as_number("count", value)?,
            None => 0.0,
        };
        match action {
            "inc" => ctx.set_property("count", count + 1.0),
            "reset" => ctx.set_property("count", 0.0),
            other => tracing::debug!("Counter ignored action {other}"),
        }
        Ok(())
    }
}

/// Appends each trigger payload to its `entries` property
#[derive(Debug, Default)]
pub struct Log;

impl NodeBehavior for Log {
    fn can_execute(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let payload = ctx.payload().cloned().unwrap_or(Value::Null);
        tracing::info!("Node {} received {payload}", ctx.id());

        let mut entries = match ctx.property("entries") {
            Some(Value::Array(entries)) => entries.clone(),
            _ => Vec::new(),
        };
        entries.push(payload);
        ctx.set_property("entries", entries);
        Ok(())
    }
}
