// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end graph behavior through the public API.

use layerflow_graph::catalog::standard_registry;
use layerflow_graph::{
    Graph, GraphError, GraphSettings, LinkId, Node, NodeBehavior, NodeContext, NodeError, NodeId, NodeRegistry,
    NodeType, Snapshot, SlotType, Value,
};
use proptest::prelude::*;
use std::cell::Cell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

struct Pass;

impl NodeBehavior for Pass {
    fn can_execute(&self) -> bool {
        true
    }
}

fn registry() -> Arc<NodeRegistry> {
    let mut registry = standard_registry();
    registry.register(
        NodeType::new("test/source", "Source")
            .with_output("out", "number")
            .with_behavior(|| Pass),
    );
    registry.register(
        NodeType::new("test/pass", "Pass")
            .with_input("in", "number")
            .with_output("out", "number")
            .with_attribute("gain", 1.0)
            .with_behavior(|| Pass),
    );
    registry.register(
        NodeType::new("test/join", "Join")
            .with_input("a", "number")
            .with_input("b", "number")
            .with_output("out", "number")
            .with_behavior(|| Pass),
    );
    Arc::new(registry)
}

/// Shape of a random graph: node kinds (`true` is a join) and raw edge picks
type GraphPlan = (Vec<bool>, Vec<(usize, usize, usize)>);

fn graph_plan() -> impl Strategy<Value = GraphPlan> {
    (
        prop::collection::vec(any::<bool>(), 2..12),
        prop::collection::vec((0..64usize, 0..64usize, 0..2usize), 0..24),
    )
}

/// Build a graph from a plan; with `acyclic` every edge runs from a lower to a higher index
fn build_graph((kinds, edges): &GraphPlan, acyclic: bool) -> Graph {
    let mut graph = Graph::new(registry());
    let ids: Vec<NodeId> = kinds
        .iter()
        .map(|join| graph.add_new(if *join { "test/join" } else { "test/pass" }).unwrap())
        .collect();
    for (a, b, slot) in edges {
        let (a, b) = (a % ids.len(), b % ids.len());
        let (origin, target) = if acyclic { (a.min(b), a.max(b)) } else { (a, b) };
        let slots = graph.node(ids[target]).unwrap().inputs().len();
        graph.connect(ids[origin], 0, ids[target], slot % slots);
    }
    graph
}

fn endpoints(graph: &Graph) -> Vec<(NodeId, usize, NodeId, usize)> {
    let mut tuples: Vec<_> = graph.links().map(|link| link.endpoints()).collect();
    tuples.sort();
    tuples
}

proptest! {
    #[test]
    fn acyclic_graphs_order_every_link_forward(plan in graph_plan()) {
        let graph = build_graph(&plan, true);
        let order = graph.compute_execution_order();
        let position = |id: NodeId| order.iter().position(|other| *other == id).unwrap();
        for link in graph.links() {
            prop_assert!(position(link.origin_id) < position(link.target_id));
        }
    }

    #[test]
    fn cyclic_graphs_keep_every_node_once(plan in graph_plan()) {
        let graph = build_graph(&plan, false);
        let order = graph.compute_execution_order();
        prop_assert_eq!(order.len(), graph.node_count());
        prop_assert_eq!(order.iter().collect::<HashSet<_>>().len(), order.len());
    }

    #[test]
    fn inputs_hold_a_single_link(plan in graph_plan()) {
        let graph = build_graph(&plan, false);
        let mut targets = HashSet::new();
        for link in graph.links() {
            prop_assert!(targets.insert((link.target_id, link.target_slot)));
            let input = &graph.node(link.target_id).unwrap().inputs()[link.target_slot];
            prop_assert_eq!(input.link(), Some(link.id));
        }
    }

    #[test]
    fn removal_leaves_no_dangling_references(plan in graph_plan(), stride in 1..4usize) {
        let mut graph = build_graph(&plan, false);
        let victims: Vec<NodeId> = graph.node_ids().step_by(stride).collect();
        for id in &victims {
            graph.remove(*id).unwrap();
        }

        let live: HashSet<LinkId> = graph.links().map(|link| link.id).collect();
        for link in graph.links() {
            prop_assert!(!victims.contains(&link.origin_id));
            prop_assert!(!victims.contains(&link.target_id));
        }
        for node in graph.nodes() {
            for input in node.inputs() {
                prop_assert!(input.link().map_or(true, |id| live.contains(&id)));
            }
            for output in node.outputs() {
                prop_assert!(output.links().iter().all(|id| live.contains(id)));
            }
        }
    }

    #[test]
    fn round_trip_keeps_nodes_links_and_properties(plan in graph_plan(), gain in -1_000_000..1_000_000i64) {
        let mut graph = build_graph(&plan, false);
        let first = graph.node_ids().next().unwrap();
        graph.set_property(first, "gain", gain);

        let text = graph.serialize().to_json().unwrap();
        let mut loaded = Graph::new(registry());
        let report = loaded.configure(&Snapshot::from_json(&text).unwrap(), false);

        prop_assert!(!report.had_errors);
        prop_assert_eq!(loaded.node_count(), graph.node_count());
        prop_assert_eq!(endpoints(&loaded), endpoints(&graph));
        for node in graph.nodes() {
            let id = node.id().unwrap();
            prop_assert_eq!(loaded.node(id).unwrap().properties(), node.properties());
        }
    }
}

#[test]
fn self_loops_are_refused() {
    let mut graph = Graph::new(registry());
    let join = graph.add_new("test/join").unwrap();
    for slot in 0..2 {
        assert_eq!(graph.connect(join, 0, join, slot), None);
    }
    assert_eq!(graph.link_count(), 0);
}

#[test]
fn trigger_reaches_every_link_even_to_one_node() {
    struct Tally(Rc<Cell<usize>>);

    impl NodeBehavior for Tally {
        fn accepts_actions(&self) -> bool {
            true
        }

        fn on_action(&mut self, _ctx: &mut NodeContext<'_>, _action: &str, _payload: &Value) -> Result<(), NodeError> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    let calls = Rc::new(Cell::new(0));
    let mut graph = Graph::new(registry());
    let emitter = graph.add_new("events/emitter").unwrap();
    let sink = graph
        .add(
            Node::new("test/tally")
                .with_input("x", SlotType::Event)
                .with_input("y", SlotType::Event)
                .with_behavior(Tally(Rc::clone(&calls))),
        )
        .unwrap();
    let other = graph.add_new("events/counter").unwrap();
    graph.connect(emitter, 0, sink, 0).unwrap();
    graph.connect(emitter, 0, sink, 1).unwrap();
    graph.connect(emitter, 0, other, 0).unwrap();

    let delivered = graph.trigger_slot(emitter, 0, Value::Null, None).unwrap();
    assert_eq!(delivered, 3);
    assert_eq!(calls.get(), 2);
}

#[test]
fn scenario_two_nodes_in_order() {
    let mut graph = Graph::new(registry());
    let b = graph.add_new("basic/watch").unwrap();
    let a = graph.add_new("test/source").unwrap();
    assert!(graph.connect(a, 0, b, 0).is_some());
    assert_eq!(graph.compute_execution_order(), vec![a, b]);
}

#[test]
fn scenario_reconnect_same_input() {
    let mut graph = Graph::new(registry());
    let a = graph.add_new("test/source").unwrap();
    let b = graph.add_new("test/pass").unwrap();
    let first = graph.connect(a, 0, b, 0).unwrap();
    let second = graph.connect(a, 0, b, 0).unwrap();
    assert_ne!(first, second);
    assert_eq!(graph.link_count(), 1);
    assert!(graph.link(first).is_none());
    assert_eq!(graph.node(a).unwrap().outputs()[0].links(), &[second]);
}

#[test]
fn scenario_cycle_with_isolated_node() {
    let mut graph = Graph::new(registry());
    let a = graph.add_new("test/pass").unwrap();
    let b = graph.add_new("test/pass").unwrap();
    let c = graph.add_new("test/pass").unwrap();
    graph.connect(a, 0, b, 0).unwrap();
    graph.connect(b, 0, a, 0).unwrap();

    let order = graph.compute_execution_order();
    assert_eq!(order.len(), 3);
    assert_eq!(order[0], c);
    assert!(order.contains(&a) && order.contains(&b));
}

#[test]
fn scenario_remove_origin() {
    let mut graph = Graph::new(registry());
    let a = graph.add_new("test/source").unwrap();
    let b = graph.add_new("test/pass").unwrap();
    let link = graph.connect(a, 0, b, 0).unwrap();

    graph.remove(a).unwrap();
    assert!(graph.link(link).is_none());
    assert_eq!(graph.node(b).unwrap().inputs()[0].link(), None);
    assert_eq!(graph.execution_order(), &[b]);
}

#[test]
fn scenario_three_nodes_round_trip() {
    let mut graph = Graph::new(registry());
    let a = graph.add_new("test/source").unwrap();
    let b = graph.add_new("test/pass").unwrap();
    let c = graph.add_new("test/join").unwrap();
    graph.connect(a, 0, b, 0).unwrap();
    graph.connect(b, 0, c, 1).unwrap();

    let snapshot = graph.serialize();
    let mut loaded = Graph::new(registry());
    loaded.configure(&snapshot, false);
    assert_eq!(loaded.node_count(), 3);
    assert_eq!(loaded.link_count(), 2);
    assert_eq!(endpoints(&loaded), vec![(a, 0, b, 0), (b, 0, c, 1)]);
}

#[test]
fn scenario_node_limit() {
    let settings = GraphSettings {
        max_nodes: 3,
        ..GraphSettings::default()
    };
    let mut graph = Graph::with_settings(registry(), settings);
    for _ in 0..3 {
        graph.add_new("test/source").unwrap();
    }
    let version = graph.version();
    let err = graph.add_new("test/source").unwrap_err();
    assert_eq!(err, GraphError::NodeLimitExceeded { limit: 3 });
    assert_eq!(graph.node_count(), 3);
    assert_eq!(graph.version(), version);
}

#[test]
fn unknown_types_survive_a_reload() {
    let text = r#"{
        "last_node_id": 2, "last_link_id": 0,
        "nodes": [{"id": 2, "type": "plugin/Custom", "properties": {"k": [1, 2]}, "shape": "box"}],
        "links": []
    }"#;
    let snapshot = Snapshot::from_json(text).unwrap();
    let mut graph = Graph::new(registry());
    let report = graph.configure(&snapshot, false);
    assert_eq!(report.missing_types, vec!["plugin/Custom"]);
    assert!(graph.node(NodeId(2)).unwrap().has_errors());
    assert_eq!(graph.serialize().nodes, snapshot.nodes);
}

#[test]
fn caught_failure_reports_and_stops() {
    let mut graph = Graph::new(registry());
    let tensor = graph.add_new("tensor/Tensor1d").unwrap();
    let conv = graph.add_new("layer/Conv2d").unwrap();
    graph.connect(tensor, 0, conv, 0).unwrap();

    graph.start();
    graph.tick().unwrap();
    assert!(graph.errors_in_execution());
    assert!(graph.get_output_data(tensor, 0).is_some());

    let mut strict = Graph::with_settings(
        registry(),
        GraphSettings {
            catch_errors: false,
            ..GraphSettings::default()
        },
    );
    strict.configure(&graph.serialize(), false);
    assert!(matches!(strict.tick(), Err(GraphError::Execution { node, .. }) if node == conv));
}
