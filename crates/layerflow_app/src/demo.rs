// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in demo pipeline used when no snapshot is given.

use crate::Result;
use layerflow_graph::order::DEFAULT_ARRANGE_MARGIN;
use layerflow_graph::{Graph, NodeId, Value};
use serde_json::json;

/// Layers of the demo CNN with the properties that differ from the defaults
fn layers() -> Vec<(&'static str, Vec<(&'static str, Value)>)> {
    vec![
        ("tensor/Tensor4d", vec![("size", json!([1, 3, 32, 32]))]),
        (
            "layer/Conv2d",
            vec![("in_channels", json!(3)), ("out_channels", json!(16)), ("padding", json!([1, 1]))],
        ),
        ("layer/ReLU", vec![]),
        ("layer/MaxPool2d", vec![]),
        ("layer/Flatten", vec![]),
        ("layer/Linear", vec![("out_features", json!(10))]),
    ]
}

/// Build `Tensor4d -> Conv2d -> ReLU -> MaxPool2d -> Flatten -> Linear -> watch`
pub fn build_cnn(graph: &mut Graph) -> Result<Vec<NodeId>> {
    graph.begin_batch();
    let result = wire(graph);
    graph.end_batch();
    let ids = result?;
    graph.arrange(DEFAULT_ARRANGE_MARGIN);
    tracing::info!("Built demo pipeline with {} nodes", ids.len());
    Ok(ids)
}

fn wire(graph: &mut Graph) -> Result<Vec<NodeId>> {
    let mut ids = Vec::new();
    for (type_id, properties) in layers() {
        let id = graph.add_new(type_id)?;
        for (name, value) in properties {
            graph.set_property(id, name, value);
        }
        if let Some(previous) = ids.last() {
            graph.connect_by_name(*previous, "out", id, "in")?;
        }
        ids.push(id);
    }
    let watch = graph.add_new("basic/watch")?;
    if let Some(last) = ids.last() {
        graph.connect_by_name(*last, "out", watch, "value")?;
    }
    ids.push(watch);
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerflow_graph::catalog::standard_registry;
    use std::sync::Arc;

    #[test]
    fn test_demo_runs() {
        let mut graph = Graph::new(Arc::new(standard_registry()));
        let ids = build_cnn(&mut graph).unwrap();
        assert_eq!(graph.node_count(), 7);
        assert_eq!(graph.link_count(), 6);

        graph.tick().unwrap();
        assert!(!graph.errors_in_execution());
        let watch = graph.node(ids[6]).unwrap();
        assert_eq!(watch.property("value"), Some(&json!([1, 10])));
    }
}
