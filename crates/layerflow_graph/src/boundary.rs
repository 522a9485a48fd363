// SPDX-License-Identifier: MIT OR Apache-2.0
//! Global boundary ports.
//!
//! A graph embedded as a subgraph exposes named inputs and outputs. The
//! embedding node listens through [`BoundaryListener`] and mirrors them as
//! its own slots.

use crate::graph::Graph;
use crate::port::{Direction, SlotType};
use indexmap::IndexMap;
use serde_json::Value;

/// A named value crossing the graph boundary
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSlot {
    /// Port name
    pub name: String,
    /// Declared type
    pub slot_type: SlotType,
    /// Current value
    pub value: Option<Value>,
}

/// Parent-side observer of boundary port edits
pub trait BoundaryListener {
    /// A port was added
    fn on_global_added(&mut self, _direction: Direction, _name: &str, _slot_type: &SlotType) {}

    /// A port was renamed
    fn on_global_renamed(&mut self, _direction: Direction, _old_name: &str, _new_name: &str) {}

    /// A port changed type
    fn on_global_type_changed(&mut self, _direction: Direction, _name: &str, _slot_type: &SlotType) {}

    /// A port was removed
    fn on_global_removed(&mut self, _direction: Direction, _name: &str) {}

    /// The set of ports changed
    fn on_globals_change(&mut self) {}
}

impl Graph {
    /// Install the boundary observer
    pub fn set_boundary_listener(&mut self, listener: Box<dyn BoundaryListener>) {
        self.boundary = Some(listener);
    }

    /// Remove the boundary observer
    pub fn take_boundary_listener(&mut self) -> Option<Box<dyn BoundaryListener>> {
        self.boundary.take()
    }

    /// Declared inputs
    pub fn global_inputs(&self) -> &IndexMap<String, GlobalSlot> {
        &self.global_inputs
    }

    /// Declared outputs
    pub fn global_outputs(&self) -> &IndexMap<String, GlobalSlot> {
        &self.global_outputs
    }

    /// Declare (or redeclare) a boundary input
    pub fn add_global_input(&mut self, name: &str, slot_type: impl Into<SlotType>, value: Option<Value>) {
        self.add_global(Direction::Input, name, slot_type.into(), value);
    }

    /// Set the value of a boundary input; unknown names are ignored
    pub fn set_global_input_data(&mut self, name: &str, value: Value) -> bool {
        set_global_value(&mut self.global_inputs, name, value)
    }

    /// Value of a boundary input
    pub fn global_input_data(&self, name: &str) -> Option<&Value> {
        self.global_inputs.get(name)?.value.as_ref()
    }

    /// Rename a boundary input. Fails if `new_name` is taken.
    pub fn rename_global_input(&mut self, old_name: &str, new_name: &str) -> bool {
        self.rename_global(Direction::Input, old_name, new_name)
    }

    /// Change the type of a boundary input. Returns whether it changed.
    pub fn change_global_input_type(&mut self, name: &str, slot_type: impl Into<SlotType>) -> bool {
        self.change_global_type(Direction::Input, name, slot_type.into())
    }

    /// Remove a boundary input
    pub fn remove_global_input(&mut self, name: &str) -> bool {
        self.remove_global(Direction::Input, name)
    }

    /// Declare (or redeclare) a boundary output
    pub fn add_global_output(&mut self, name: &str, slot_type: impl Into<SlotType>, value: Option<Value>) {
        self.add_global(Direction::Output, name, slot_type.into(), value);
    }

    /// Set the value of a boundary output; unknown names are ignored
    pub fn set_global_output_data(&mut self, name: &str, value: Value) -> bool {
        set_global_value(&mut self.global_outputs, name, value)
    }

    /// Value of a boundary output
    pub fn global_output_data(&self, name: &str) -> Option<&Value> {
        self.global_outputs.get(name)?.value.as_ref()
    }

    /// Rename a boundary output. Fails if `new_name` is taken.
    pub fn rename_global_output(&mut self, old_name: &str, new_name: &str) -> bool {
        self.rename_global(Direction::Output, old_name, new_name)
    }

    /// Change the type of a boundary output. Returns whether it changed.
    pub fn change_global_output_type(&mut self, name: &str, slot_type: impl Into<SlotType>) -> bool {
        self.change_global_type(Direction::Output, name, slot_type.into())
    }

    /// Remove a boundary output
    pub fn remove_global_output(&mut self, name: &str) -> bool {
        self.remove_global(Direction::Output, name)
    }

    fn globals_mut(&mut self, direction: Direction) -> &mut IndexMap<String, GlobalSlot> {
        match direction {
            Direction::Input => &mut self.global_inputs,
            Direction::Output => &mut self.global_outputs,
        }
    }

    fn add_global(&mut self, direction: Direction, name: &str, slot_type: SlotType, value: Option<Value>) {
        self.globals_mut(direction).insert(
            name.to_string(),
            GlobalSlot {
                name: name.to_string(),
                slot_type: slot_type.clone(),
                value,
            },
        );
        self.version += 1;
        tracing::debug!("Global {direction:?} added: {name}");
        if let Some(listener) = self.boundary.as_mut() {
            listener.on_global_added(direction, name, &slot_type);
            listener.on_globals_change();
        }
        self.change();
    }

    fn rename_global(&mut self, direction: Direction, old_name: &str, new_name: &str) -> bool {
        if old_name == new_name {
            return false;
        }
        let globals = self.globals_mut(direction);
        if globals.contains_key(new_name) {
            tracing::warn!("There is already a global {direction:?} named {new_name}");
            return false;
        }
        let Some((index, _, mut slot)) = globals.shift_remove_full(old_name) else {
            return false;
        };
        slot.name = new_name.to_string();
        globals.shift_insert(index, new_name.to_string(), slot);

        self.version += 1;
        if let Some(listener) = self.boundary.as_mut() {
            listener.on_global_renamed(direction, old_name, new_name);
            listener.on_globals_change();
        }
        self.change();
        true
    }

    fn change_global_type(&mut self, direction: Direction, name: &str, slot_type: SlotType) -> bool {
        let Some(slot) = self.globals_mut(direction).get_mut(name) else {
            return false;
        };
        if slot.slot_type.to_string().eq_ignore_ascii_case(&slot_type.to_string()) {
            return false;
        }
        slot.slot_type = slot_type.clone();

        self.version += 1;
        if let Some(listener) = self.boundary.as_mut() {
            listener.on_global_type_changed(direction, name, &slot_type);
        }
        self.change();
        true
    }

    fn remove_global(&mut self, direction: Direction, name: &str) -> bool {
        if self.globals_mut(direction).shift_remove(name).is_none() {
            return false;
        }
        self.version += 1;
        if let Some(listener) = self.boundary.as_mut() {
            listener.on_global_removed(direction, name);
            listener.on_globals_change();
        }
        self.change();
        true
    }
}

fn set_global_value(globals: &mut IndexMap<String, GlobalSlot>, name: &str, value: Value) -> bool {
    match globals.get_mut(name) {
        Some(slot) => {
            slot.value = Some(value);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Mirror(Rc<RefCell<Vec<String>>>);

    impl BoundaryListener for Mirror {
        fn on_global_added(&mut self, direction: Direction, name: &str, slot_type: &SlotType) {
            self.0.borrow_mut().push(format!("add {direction:?} {name} {slot_type}"));
        }

        fn on_global_renamed(&mut self, direction: Direction, old_name: &str, new_name: &str) {
            self.0.borrow_mut().push(format!("rename {direction:?} {old_name} {new_name}"));
        }

        fn on_global_type_changed(&mut self, direction: Direction, name: &str, slot_type: &SlotType) {
            self.0.borrow_mut().push(format!("type {direction:?} {name} {slot_type}"));
        }

        fn on_global_removed(&mut self, direction: Direction, name: &str) {
            self.0.borrow_mut().push(format!("remove {direction:?} {name}"));
        }
    }

    #[test]
    fn test_input_lifecycle() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut graph = Graph::default();
        graph.set_boundary_listener(Box::new(Mirror(Rc::clone(&events))));

        let v0 = graph.version();
        graph.add_global_input("x", "tensor", None);
        assert!(graph.version() > v0);
        assert!(graph.set_global_input_data("x", json!([1, 3])));
        assert_eq!(graph.global_input_data("x"), Some(&json!([1, 3])));
        assert!(!graph.set_global_input_data("nope", json!(1)));

        graph.add_global_input("y", "number", None);
        assert!(!graph.rename_global_input("x", "y"));
        assert!(graph.rename_global_input("x", "image"));
        assert_eq!(
            graph.global_inputs().keys().collect::<Vec<_>>(),
            vec!["image", "y"]
        );
        assert_eq!(graph.global_input_data("image"), Some(&json!([1, 3])));

        assert!(!graph.change_global_input_type("image", "TENSOR"));
        assert!(graph.change_global_input_type("image", "number"));
        assert!(graph.remove_global_input("image"));
        assert!(!graph.remove_global_input("image"));

        assert_eq!(
            *events.borrow(),
            vec![
                "add Input x tensor",
                "add Input y number",
                "rename Input x image",
                "type Input image number",
                "remove Input image",
            ]
        );
    }

    #[test]
    fn test_outputs_are_separate() {
        let mut graph = Graph::default();
        graph.add_global_output("loss", "number", Some(json!(0.5)));
        assert_eq!(graph.global_output_data("loss"), Some(&json!(0.5)));
        assert!(graph.global_input_data("loss").is_none());
        assert!(graph.rename_global_output("loss", "score"));
        assert!(graph.set_global_output_data("score", json!(0.25)));
        assert_eq!(graph.global_output_data("score"), Some(&json!(0.25)));
        assert!(graph.remove_global_output("score"));
        assert!(graph.global_outputs().is_empty());
    }
}
