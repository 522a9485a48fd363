// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in node kinds.
//!
//! Each submodule registers one family of kinds. [`standard_registry`] puts
//! all of them in a fresh registry.

pub mod basic;
pub mod boundary;
pub mod events;
pub mod layers;

use crate::execution::NodeError;
use crate::registry::NodeRegistry;
use serde_json::Value;

/// Register every built-in kind
pub fn register_all(registry: &mut NodeRegistry) {
    basic::register(registry);
    events::register(registry);
    boundary::register(registry);
    layers::register(registry);
}

/// A registry holding every built-in kind
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}

/// Read a number out of a property or payload value.
///
/// Numeric strings are accepted since editors often store text fields.
pub(crate) fn as_number(name: &str, value: &Value) -> Result<f64, NodeError> {
    match value {
        Value::Number(number) => number.as_f64().ok_or_else(|| NodeError::InvalidProperty {
            name: name.to_string(),
            reason: format!("{number} is out of range"),
        }),
        Value::String(text) => text.trim().parse().map_err(|_| NodeError::InvalidProperty {
            name: name.to_string(),
            reason: format!("{text:?} is not a number"),
        }),
        Value::Bool(flag) => Ok(f64::from(u8::from(*flag))),
        other => Err(NodeError::InvalidProperty {
            name: name.to_string(),
            reason: format!("expected a number, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_standard_registry_categories() {
        let registry = standard_registry();
        assert_eq!(registry.categories(), vec!["basic", "events", "graph", "layer", "tensor"]);
        assert!(registry.contains("layer/Conv2d"));
        assert!(registry.contains("tensor/Tensor4d"));
    }

    #[test]
    fn test_as_number() {
        assert_eq!(as_number("v", &json!(2.5)).unwrap(), 2.5);
        assert_eq!(as_number("v", &json!(" 3 ")).unwrap(), 3.0);
        assert_eq!(as_number("v", &json!(true)).unwrap(), 1.0);
        assert!(matches!(
            as_number("v", &json!([1])),
            Err(NodeError::InvalidProperty { .. })
        ));
    }
}
