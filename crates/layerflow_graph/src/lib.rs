// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dataflow graph engine for layerflow.
//!
//! This crate provides the graph model behind the layer pipeline editor:
//! - Nodes with typed input/output slots, properties and pluggable behaviors
//! - Links with connection validation and single-writer inputs
//! - Execution ordering (Kahn's algorithm with a priority tie-break)
//! - Stepped execution and event triggers
//! - Subgraph boundary ports
//! - Lossless snapshots
//!
//! ## Architecture
//!
//! The [`Graph`] owns every [`Node`] and [`Link`] and hands out IDs; nodes
//! never reference each other directly. Node kinds are described by a
//! [`NodeType`] in a [`NodeRegistry`], which the graph uses to create nodes
//! and to revive them from a [`Snapshot`].

pub mod boundary;
pub mod catalog;
pub mod execution;
pub mod graph;
pub mod group;
pub mod link;
pub mod node;
pub mod order;
pub mod port;
pub mod registry;
pub mod settings;
pub mod snapshot;
pub mod style;

pub use boundary::{BoundaryListener, GlobalSlot};
pub use execution::{GraphStatus, NodeContext, NodeError};
pub use graph::{ConnectionError, Graph, GraphError, GraphHooks};
pub use group::Group;
pub use link::{Link, LinkId};
pub use node::{ConnectionChange, Node, NodeBehavior, NodeFlags, NodeId, NodeMode};
pub use port::{is_valid_connection, Direction, InputSlot, OutputSlot, SlotType};
pub use registry::{NodeRegistry, NodeType, RegistryError};
pub use settings::GraphSettings;
pub use snapshot::{LinkRecord, LoadReport, NodeRecord, Snapshot, SnapshotError};
pub use serde_json::Value;
