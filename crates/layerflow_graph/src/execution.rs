// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph execution: the stepped run loop, event dispatch and port data access.
//!
//! Execution is synchronous and single threaded. While a node body runs its
//! behavior is detached from the node, which lets the body borrow the whole
//! graph through [`NodeContext`] and lets triggers recurse downstream. A node
//! that is already running further up the call stack is skipped.

use crate::graph::{Graph, GraphError};
use crate::link::LinkId;
use crate::node::{Node, NodeId, NodeMode};
use serde_json::Value;
use std::time::Instant;

/// Error raised by a node body
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    /// Missing required input
    #[error("Missing required input: {0}")]
    MissingInput(String),

    /// Input present but unusable
    #[error("Invalid input {slot}: {reason}")]
    InvalidInput {
        /// Input name
        slot: String,
        /// What is wrong with it
        reason: String,
    },

    /// Property present but unusable
    #[error("Invalid property {name}: {reason}")]
    InvalidProperty {
        /// Property name
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// Tensor shape does not fit the layer
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A graph operation started by the body failed
    #[error(transparent)]
    Graph(Box<GraphError>),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}

impl From<GraphError> for NodeError {
    fn from(err: GraphError) -> Self {
        Self::Graph(Box::new(err))
    }
}

/// Whether the graph is being ticked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphStatus {
    /// Not running
    #[default]
    Stopped,
    /// Running
    Running,
}

/// What a node body sees of the graph while it runs
pub struct NodeContext<'a> {
    graph: &'a mut Graph,
    node: NodeId,
    payload: Option<Value>,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(graph: &'a mut Graph, node: NodeId, payload: Option<Value>) -> Self {
        Self { graph, node, payload }
    }

    /// ID of the running node
    pub fn id(&self) -> NodeId {
        self.node
    }

    /// The running node's data
    pub fn node(&self) -> Option<&Node> {
        self.graph.node(self.node)
    }

    /// The whole graph
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// The whole graph, mutably
    pub fn graph_mut(&mut self) -> &mut Graph {
        self.graph
    }

    /// Payload of the trigger that started this run, if any
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Read a property of the running node
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.node()?.property(name)
    }

    /// Store a property of the running node
    pub fn set_property(&mut self, name: &str, value: impl Into<Value>) {
        self.graph.store_property(self.node, name, value.into());
    }

    /// Last value written to the link feeding an input
    pub fn get_input_data(&self, slot: usize) -> Option<&Value> {
        self.graph.get_input_data(self.node, slot)
    }

    /// Run the producer of an input, then read it
    pub fn pull_input_data(&mut self, slot: usize) -> Result<Option<Value>, NodeError> {
        Ok(self.graph.pull_input_data(self.node, slot)?)
    }

    /// Input data by slot name, falling back to the property of that name
    pub fn get_input_or_property(&self, name: &str) -> Option<&Value> {
        self.graph.get_input_or_property(self.node, name)
    }

    /// Write an output and every link leaving it
    pub fn set_output_data(&mut self, slot: usize, value: impl Into<Value>) {
        self.graph.set_output_data(self.node, slot, value.into());
    }

    /// Fire the event outputs of the running node
    pub fn trigger(&mut self, action: Option<&str>, payload: Value) -> Result<usize, NodeError> {
        Ok(self.graph.trigger(self.node, action, payload)?)
    }

    /// Fire one output of the running node
    pub fn trigger_slot(
        &mut self,
        slot: usize,
        payload: Value,
        only_link: Option<LinkId>,
    ) -> Result<usize, NodeError> {
        Ok(self.graph.trigger_slot(self.node, slot, payload, only_link)?)
    }

    /// Seconds since the graph was created, as of the current step
    pub fn global_time(&self) -> f64 {
        self.graph.global_time
    }

    /// Simulation time
    pub fn fixed_time(&self) -> f64 {
        self.graph.fixed_time
    }
}

impl Graph {
    /// Current run status
    pub fn status(&self) -> GraphStatus {
        self.status
    }

    /// Start running. Nodes are told; nothing is ticked.
    pub fn start(&mut self) {
        if self.status == GraphStatus::Running {
            return;
        }
        self.status = GraphStatus::Running;
        self.last_update = Some(Instant::now());
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_start();
        }
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.with_behavior(id, |behavior, _| behavior.on_start());
        }
        tracing::info!("Graph started");
    }

    /// Stop running. Does nothing if already stopped.
    pub fn stop(&mut self) {
        if self.status == GraphStatus::Stopped {
            return;
        }
        self.status = GraphStatus::Stopped;
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_stop();
        }
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.with_behavior(id, |behavior, _| behavior.on_stop());
        }
        tracing::info!("Graph stopped");
    }

    /// Run one step with the error policy from the settings
    pub fn tick(&mut self) -> Result<(), GraphError> {
        self.run_step(1, !self.settings.catch_errors)
    }

    /// Run `iterations` passes over the executable nodes.
    ///
    /// With `propagate_errors` the first failure aborts the step and is
    /// returned. Otherwise it is logged, flagged and the graph stops.
    pub fn run_step(&mut self, iterations: usize, propagate_errors: bool) -> Result<(), GraphError> {
        let started = Instant::now();
        self.global_time = started.duration_since(self.epoch).as_secs_f64();
        if self.order_dirty {
            self.update_execution_order();
        }

        let result = match self.run_passes(iterations) {
            Ok(()) => {
                if !propagate_errors {
                    self.errors_in_execution = false;
                }
                Ok(())
            }
            Err(err) if propagate_errors => Err(err),
            Err(err) => {
                self.errors_in_execution = true;
                tracing::error!("Error during execution: {err}");
                self.stop();
                Ok(())
            }
        };

        let now = Instant::now();
        self.execution_time = now.duration_since(started).as_secs_f64();
        self.global_time += self.execution_time;
        self.iteration += 1;
        self.elapsed_time = self
            .last_update
            .map_or(0.0, |last| now.duration_since(last).as_secs_f64());
        self.last_update = Some(now);
        result
    }

    /// Runs the passes, then notifies the hooks whether or not a pass failed
    fn run_passes(&mut self, iterations: usize) -> Result<(), GraphError> {
        let result = self.passes(iterations);
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_after_execute();
        }
        result
    }

    fn passes(&mut self, iterations: usize) -> Result<(), GraphError> {
        for _ in 0..iterations {
            let executable = self.executable.clone();
            for id in executable {
                let always = self.nodes.get(&id).is_some_and(|node| node.mode == NodeMode::Always);
                if always {
                    self.execute_node(id)?;
                }
            }
            self.fixed_time += self.settings.fixed_time_lapse;
            if let Some(hooks) = self.hooks.as_mut() {
                hooks.on_execute_step();
            }
        }
        Ok(())
    }

    /// Run one node body now. Returns whether it actually ran.
    pub fn execute_node(&mut self, id: NodeId) -> Result<bool, GraphError> {
        self.run_body(id, None)
    }

    fn run_body(&mut self, id: NodeId, payload: Option<Value>) -> Result<bool, GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))?;
        if !node.capabilities.execute {
            return Ok(false);
        }
        let Some(mut behavior) = node.behavior.take() else {
            tracing::trace!("Node {id} is already running, skipped");
            return Ok(false);
        };
        let result = behavior.execute(&mut NodeContext::new(self, id, payload));
        self.restore_behavior(id, behavior);
        result
            .map(|()| true)
            .map_err(|source| GraphError::Execution { node: id, source })
    }

    fn run_action(&mut self, id: NodeId, action: &str, payload: &Value) -> Result<bool, GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))?;
        let Some(mut behavior) = node.behavior.take() else {
            tracing::trace!("Node {id} is already running, action {action} skipped");
            return Ok(false);
        };
        let result = behavior.on_action(&mut NodeContext::new(self, id, Some(payload.clone())), action, payload);
        self.restore_behavior(id, behavior);
        result
            .map(|()| true)
            .map_err(|source| GraphError::Execution { node: id, source })
    }

    /// Fire an output: every link (or only `only_link`) delivers `payload`.
    ///
    /// Targets that accept actions get `on_action` with their input name;
    /// otherwise targets in [`NodeMode::OnTrigger`] are executed. Returns the
    /// number of deliveries.
    pub fn trigger_slot(
        &mut self,
        id: NodeId,
        slot: usize,
        payload: Value,
        only_link: Option<LinkId>,
    ) -> Result<usize, GraphError> {
        let node = self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))?;
        let Some(output) = node.outputs.get(slot) else {
            tracing::debug!("Node {id} has no output {slot} to trigger");
            return Ok(0);
        };
        let link_ids: Vec<LinkId> = output
            .links
            .iter()
            .copied()
            .filter(|link_id| only_link.map_or(true, |only| only == *link_id))
            .collect();

        let now = self.epoch.elapsed().as_secs_f64();
        let mut delivered = 0;
        for link_id in link_ids {
            let Some(link) = self.links.get_mut(&link_id) else {
                continue;
            };
            link.last_triggered_at = Some(now);
            let (target, target_slot) = (link.target_id, link.target_slot);
            let Some(target_node) = self.nodes.get(&target) else {
                continue;
            };

            let ran = if target_node.capabilities.actions {
                let action = target_node
                    .inputs
                    .get(target_slot)
                    .map(|input| input.name.clone())
                    .unwrap_or_default();
                self.run_action(target, &action, &payload)?
            } else if target_node.mode == NodeMode::OnTrigger {
                self.run_body(target, Some(payload.clone()))?
            } else {
                false
            };
            if ran {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Fire every event output of a node, or only those named `action`
    pub fn trigger(&mut self, id: NodeId, action: Option<&str>, payload: Value) -> Result<usize, GraphError> {
        let node = self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))?;
        let slots: Vec<usize> = node
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, output)| output.slot_type.is_event())
            .filter(|(_, output)| action.map_or(true, |name| output.name == name))
            .map(|(slot, _)| slot)
            .collect();

        let mut delivered = 0;
        for slot in slots {
            delivered += self.trigger_slot(id, slot, payload.clone(), None)?;
        }
        Ok(delivered)
    }

    /// Reset the trigger timestamp of an output's links
    pub fn clear_triggered_slot(&mut self, id: NodeId, slot: usize, only_link: Option<LinkId>) {
        let Some(output) = self.nodes.get(&id).and_then(|node| node.outputs.get(slot)) else {
            return;
        };
        for link_id in &output.links {
            if only_link.is_some_and(|only| only != *link_id) {
                continue;
            }
            if let Some(link) = self.links.get_mut(link_id) {
                link.last_triggered_at = None;
            }
        }
    }

    /// Reset every trigger timestamp
    pub fn clear_triggered_slots(&mut self) {
        for link in self.links.values_mut() {
            link.last_triggered_at = None;
        }
    }

    /// Last value written to the link feeding an input
    pub fn get_input_data(&self, id: NodeId, slot: usize) -> Option<&Value> {
        self.input_link(id, slot)?.data.as_ref()
    }

    /// Execute the producer of an input first, then read the input
    pub fn pull_input_data(&mut self, id: NodeId, slot: usize) -> Result<Option<Value>, GraphError> {
        let Some(origin) = self.input_link(id, slot).map(|link| link.origin_id) else {
            return Ok(None);
        };
        self.execute_node(origin)?;
        Ok(self.get_input_data(id, slot).cloned())
    }

    /// Input data by slot name, falling back to the property of that name
    pub fn get_input_or_property(&self, id: NodeId, name: &str) -> Option<&Value> {
        let node = self.nodes.get(&id)?;
        node.find_input_slot(name)
            .and_then(|slot| self.get_input_data(id, slot))
            .or_else(|| node.property(name))
    }

    /// Value last written to an output
    pub fn get_output_data(&self, id: NodeId, slot: usize) -> Option<&Value> {
        self.nodes.get(&id)?.outputs.get(slot)?.data.as_ref()
    }

    /// Write an output and every link leaving it
    pub fn set_output_data(&mut self, id: NodeId, slot: usize, value: Value) -> bool {
        let Some(output) = self.nodes.get_mut(&id).and_then(|node| node.outputs.get_mut(slot)) else {
            return false;
        };
        for link_id in &output.links {
            if let Some(link) = self.links.get_mut(link_id) {
                link.data = Some(value.clone());
            }
        }
        output.data = Some(value);
        true
    }

    /// Steps run so far
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Seconds since creation as of the last step
    pub fn global_time(&self) -> f64 {
        self.global_time
    }

    /// Simulation time, advanced by the fixed lapse per iteration
    pub fn fixed_time(&self) -> f64 {
        self.fixed_time
    }

    /// Duration of the last step in seconds
    pub fn execution_time(&self) -> f64 {
        self.execution_time
    }

    /// Seconds between the last two steps
    pub fn elapsed_time(&self) -> f64 {
        self.elapsed_time
    }

    /// Whether the last caught step failed
    pub fn errors_in_execution(&self) -> bool {
        self.errors_in_execution
    }
}
