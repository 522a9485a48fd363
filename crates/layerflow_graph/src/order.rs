// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution ordering.
//!
//! Nodes are ordered with Kahn's algorithm over the link structure. Nodes
//! caught in a cycle are never released by the queue; they are appended in
//! storage order so that every node still gets a position. The result is then
//! stably sorted by priority.

use crate::graph::Graph;
use crate::node::NodeId;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Default spacing used by [`Graph::arrange`]
pub const DEFAULT_ARRANGE_MARGIN: f32 = 40.0;

struct Traversal {
    order: Vec<NodeId>,
    levels: HashMap<NodeId, usize>,
}

impl Graph {
    fn traverse(&self) -> Traversal {
        let mut remaining: HashMap<NodeId, usize> = HashMap::new();
        let mut levels: HashMap<NodeId, usize> = HashMap::new();
        let mut queue = VecDeque::new();

        for (id, node) in &self.nodes {
            let indegree = node.inputs.iter().filter(|input| input.link.is_some()).count();
            if indegree == 0 {
                queue.push_back(*id);
                levels.insert(*id, 1);
            } else {
                remaining.insert(*id, indegree);
            }
        }

        let mut visited_links = HashSet::new();
        let mut placed = HashSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            placed.insert(id);
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let level = levels.get(&id).copied().unwrap_or(1);

            for output in &node.outputs {
                for link_id in &output.links {
                    if !visited_links.insert(*link_id) {
                        continue;
                    }
                    let Some(link) = self.links.get(link_id) else {
                        continue;
                    };
                    let target = link.target_id;
                    if !self.nodes.contains_key(&target) {
                        continue;
                    }

                    let target_level = levels.entry(target).or_insert(0);
                    *target_level = (*target_level).max(level + 1);

                    if let Some(count) = remaining.get_mut(&target) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            remaining.remove(&target);
                            queue.push_back(target);
                        }
                    }
                }
            }
        }

        for id in self.nodes.keys() {
            if !placed.contains(id) {
                order.push(*id);
                levels.insert(*id, 0);
            }
        }

        let first_pass: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(index, id)| (*id, index)).collect();
        order.sort_by_key(|id| {
            let priority = self.nodes.get(id).map_or(0, |node| node.priority());
            (priority, first_pass.get(id).copied().unwrap_or(usize::MAX))
        });

        Traversal { order, levels }
    }

    /// Compute a fresh execution order without touching the cache
    pub fn compute_execution_order(&self) -> Vec<NodeId> {
        self.traverse().order
    }

    /// Depth of every node, in storage order.
    ///
    /// Sources are level 1 and every other node sits one past its deepest
    /// predecessor. Nodes caught in a cycle are level 0.
    pub fn compute_levels(&self) -> IndexMap<NodeId, usize> {
        let levels = self.traverse().levels;
        self.nodes
            .keys()
            .map(|id| (*id, levels.get(id).copied().unwrap_or(0)))
            .collect()
    }

    /// Recompute and cache the execution order and the executable list
    pub fn update_execution_order(&mut self) {
        let order = self.compute_execution_order();
        for (index, id) in order.iter().enumerate() {
            if let Some(node) = self.nodes.get_mut(id) {
                node.order = index;
            }
        }
        self.executable = order
            .iter()
            .copied()
            .filter(|id| self.nodes.get(id).is_some_and(|node| node.capabilities.execute))
            .collect();
        self.execution_order = order;
        self.order_dirty = false;
        tracing::trace!("Execution order updated: {} nodes", self.execution_order.len());
    }

    /// Cached execution order
    pub fn execution_order(&self) -> &[NodeId] {
        &self.execution_order
    }

    /// Cached execution order restricted to nodes with an execute body
    pub fn executable(&self) -> &[NodeId] {
        &self.executable
    }

    /// Lay nodes out in columns by level, sources on the left
    pub fn arrange(&mut self, margin: f32) {
        let traversal = self.traverse();
        let mut columns: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
        for id in &traversal.order {
            let level = traversal.levels.get(id).copied().unwrap_or(0).max(1);
            columns.entry(level).or_default().push(*id);
        }

        let mut x = margin;
        for column in columns.values() {
            let mut widest: f32 = 100.0;
            let mut y = margin;
            for id in column {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.pos = [x, y];
                    widest = widest.max(node.size[0]);
                    y += node.size[1] + margin;
                }
            }
            x += widest + margin;
        }
        self.version += 1;
        self.change();
    }

    /// Every node upstream of `id`, sorted by execution order
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut ancestors = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut pending = VecDeque::from([id]);

        while let Some(current) = pending.pop_front() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            for input in &node.inputs {
                let Some(origin) = input
                    .link
                    .and_then(|link_id| self.links.get(&link_id))
                    .map(|link| link.origin_id)
                else {
                    continue;
                };
                if self.nodes.contains_key(&origin) && seen.insert(origin) {
                    ancestors.push(origin);
                    pending.push_back(origin);
                }
            }
        }

        ancestors.sort_by_key(|ancestor| self.nodes.get(ancestor).map_or(usize::MAX, |node| node.order));
        ancestors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeBehavior};

    struct Runs;

    impl NodeBehavior for Runs {
        fn can_execute(&self) -> bool {
            true
        }
    }

    fn pass_through(graph: &mut Graph) -> NodeId {
        graph
            .add(
                Node::new("test/pass")
                    .with_input("in", "number")
                    .with_output("out", "number")
                    .with_behavior(Runs),
            )
            .unwrap()
    }

    #[test]
    fn test_chain_in_dependency_order() {
        let mut graph = Graph::default();
        let c = pass_through(&mut graph);
        let b = pass_through(&mut graph);
        let a = pass_through(&mut graph);
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(b, 0, c, 0).unwrap();

        assert_eq!(graph.execution_order(), &[a, b, c]);
        assert_eq!(graph.node(a).unwrap().order(), 0);
        assert_eq!(graph.node(c).unwrap().order(), 2);
    }

    #[test]
    fn test_cycle_nodes_still_ordered() {
        let mut graph = Graph::default();
        let a = pass_through(&mut graph);
        let b = pass_through(&mut graph);
        let free = pass_through(&mut graph);
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(b, 0, a, 0).unwrap();

        assert_eq!(graph.execution_order(), &[free, a, b]);
        let levels = graph.compute_levels();
        assert_eq!(levels[&a], 0);
        assert_eq!(levels[&free], 1);
    }

    #[test]
    fn test_priority_sorts_stably() {
        let mut graph = Graph::default();
        let a = pass_through(&mut graph);
        let b = pass_through(&mut graph);
        let c = pass_through(&mut graph);
        assert_eq!(graph.execution_order(), &[a, b, c]);

        graph.set_priority(c, Some(-1));
        assert_eq!(graph.execution_order(), &[c, a, b]);
        graph.set_priority(a, Some(5));
        assert_eq!(graph.execution_order(), &[c, b, a]);
    }

    #[test]
    fn test_executable_skips_inert_nodes() {
        let mut graph = Graph::default();
        let inert = graph.add(Node::new("test/inert").with_output("out", "number")).unwrap();
        let runs = pass_through(&mut graph);
        graph.connect(inert, 0, runs, 0).unwrap();
        assert_eq!(graph.execution_order(), &[inert, runs]);
        assert_eq!(graph.executable(), &[runs]);
    }

    #[test]
    fn test_batch_defers_recompute() {
        let mut graph = Graph::default();
        let b = pass_through(&mut graph);
        graph.begin_batch();
        let a = pass_through(&mut graph);
        graph.connect(a, 0, b, 0).unwrap();
        assert_eq!(graph.execution_order(), &[b]);
        graph.end_batch();
        assert_eq!(graph.execution_order(), &[a, b]);
    }

    #[test]
    fn test_levels_follow_longest_path() {
        let mut graph = Graph::default();
        let a = pass_through(&mut graph);
        let b = pass_through(&mut graph);
        let join = graph
            .add(
                Node::new("test/join")
                    .with_input("x", "number")
                    .with_input("y", "number")
                    .with_behavior(Runs),
            )
            .unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(a, 0, join, 0).unwrap();
        graph.connect(b, 0, join, 1).unwrap();

        let levels = graph.compute_levels();
        assert_eq!(levels.values().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_arrange_columns() {
        let mut graph = Graph::default();
        let a = pass_through(&mut graph);
        let b = pass_through(&mut graph);
        let c = pass_through(&mut graph);
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(a, 0, c, 0).unwrap();
        graph.arrange(DEFAULT_ARRANGE_MARGIN);

        let pos = |id| graph.node(id).unwrap().pos();
        assert_eq!(pos(a), [40.0, 40.0]);
        assert!(pos(b)[0] > pos(a)[0]);
        assert_eq!(pos(b)[0], pos(c)[0]);
        assert!(pos(c)[1] > pos(b)[1]);
    }

    #[test]
    fn test_ancestors() {
        let mut graph = Graph::default();
        let a = pass_through(&mut graph);
        let b = pass_through(&mut graph);
        let c = pass_through(&mut graph);
        let unrelated = pass_through(&mut graph);
        graph.connect(b, 0, c, 0).unwrap();
        graph.connect(a, 0, b, 0).unwrap();

        assert_eq!(graph.ancestors(c), vec![a, b]);
        assert!(graph.ancestors(a).is_empty());
        assert!(graph.ancestors(unrelated).is_empty());
    }
}
