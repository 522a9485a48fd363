// SPDX-License-Identifier: MIT OR Apache-2.0
//! Slot definitions for node inputs/outputs.

use crate::link::LinkId;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Slot direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Input slot
    Input,
    /// Output slot
    Output,
}

/// Data type accepted or produced by a slot.
///
/// On the wire the wildcard is `0` (an empty string or `"*"` is accepted too),
/// the event/action type is `-1`, and everything else is a type name. A name
/// may list several types separated by commas, any of which can match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SlotType {
    /// Matches any other type
    #[default]
    Any,
    /// Event output / action input
    Event,
    /// Named type, possibly a comma separated list
    Named(String),
}

impl SlotType {
    /// Create a named slot type
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        match name.as_str() {
            "" | "*" => Self::Any,
            _ => Self::Named(name),
        }
    }

    /// Whether this is the wildcard type
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Whether this is the event/action type
    pub fn is_event(&self) -> bool {
        matches!(self, Self::Event)
    }

    /// Lower-cased alternatives of a named type
    fn alternatives(name: &str) -> impl Iterator<Item = String> + '_ {
        name.split(',').map(|part| part.trim().to_lowercase())
    }
}

impl From<&str> for SlotType {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<String> for SlotType {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Event => f.write_str("event"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl Serialize for SlotType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Any => serializer.serialize_i64(0),
            Self::Event => serializer.serialize_i64(-1),
            Self::Named(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for SlotType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SlotTypeVisitor;

        impl<'de> Visitor<'de> for SlotTypeVisitor {
            type Value = SlotType;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a type name, 0 for any type, or -1 for events")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<SlotType, E> {
                match v {
                    0 => Ok(SlotType::Any),
                    -1 => Ok(SlotType::Event),
                    other => Err(E::invalid_value(de::Unexpected::Signed(other), &self)),
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<SlotType, E> {
                match v {
                    0 => Ok(SlotType::Any),
                    other => Err(E::invalid_value(de::Unexpected::Unsigned(other), &self)),
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<SlotType, E> {
                Ok(SlotType::named(v))
            }

            fn visit_unit<E: de::Error>(self) -> Result<SlotType, E> {
                Ok(SlotType::Any)
            }

            fn visit_none<E: de::Error>(self) -> Result<SlotType, E> {
                Ok(SlotType::Any)
            }
        }

        deserializer.deserialize_any(SlotTypeVisitor)
    }
}

/// Check whether an output of type `output` may feed an input of type `input`.
///
/// Valid when either side is the wildcard, both are the event type, the names
/// are equal, or the comma separated alternatives share at least one entry
/// (compared case-insensitively).
pub fn is_valid_connection(output: &SlotType, input: &SlotType) -> bool {
    match (output, input) {
        (SlotType::Any, _) | (_, SlotType::Any) => true,
        (SlotType::Event, SlotType::Event) => true,
        (SlotType::Named(a), SlotType::Named(b)) => {
            if a == b {
                return true;
            }
            SlotType::alternatives(a).any(|left| SlotType::alternatives(b).any(|right| left == right))
        }
        _ => false,
    }
}

/// An input slot on a node; holds at most one link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSlot {
    /// Slot name
    pub name: String,
    /// Accepted type
    #[serde(rename = "type", default)]
    pub slot_type: SlotType,
    /// Incoming link
    #[serde(default)]
    pub(crate) link: Option<LinkId>,
    /// Display label, if different from the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl InputSlot {
    /// Create a new unconnected input
    pub fn new(name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        Self {
            name: name.into(),
            slot_type: slot_type.into(),
            link: None,
            label: None,
        }
    }

    /// Set the display label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// The incoming link, if connected
    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    /// Whether a link feeds this input
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Text shown for this slot
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

/// An output slot on a node; may feed any number of links
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSlot {
    /// Slot name
    pub name: String,
    /// Produced type
    #[serde(rename = "type", default)]
    pub slot_type: SlotType,
    /// Outgoing links
    #[serde(default, deserialize_with = "null_as_empty")]
    pub(crate) links: Vec<LinkId>,
    /// Display label, if different from the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Last value written, kept for inspection only
    #[serde(skip)]
    pub(crate) data: Option<Value>,
}

impl OutputSlot {
    /// Create a new unconnected output
    pub fn new(name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        Self {
            name: name.into(),
            slot_type: slot_type.into(),
            links: Vec::new(),
            label: None,
            data: None,
        }
    }

    /// Set the display label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Outgoing links
    pub fn links(&self) -> &[LinkId] {
        &self.links
    }

    /// Whether any link leaves this output
    pub fn is_connected(&self) -> bool {
        !self.links.is_empty()
    }

    /// The last value written to this output
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Text shown for this slot
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<LinkId>, D::Error> {
    Ok(Option::<Vec<LinkId>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_everything() {
        let tensor = SlotType::named("tensor");
        assert!(is_valid_connection(&SlotType::Any, &tensor));
        assert!(is_valid_connection(&tensor, &SlotType::Any));
        assert!(is_valid_connection(&SlotType::Any, &SlotType::Event));
    }

    #[test]
    fn test_named_types() {
        assert!(is_valid_connection(&"number".into(), &"number".into()));
        assert!(is_valid_connection(&"Number".into(), &"number".into()));
        assert!(!is_valid_connection(&"number".into(), &"string".into()));
        assert!(is_valid_connection(&"tensor,number".into(), &"string,Number".into()));
        assert!(!is_valid_connection(&"tensor,number".into(), &"string,boolean".into()));
    }

    #[test]
    fn test_events_only_pair_with_events() {
        assert!(is_valid_connection(&SlotType::Event, &SlotType::Event));
        assert!(!is_valid_connection(&SlotType::Event, &"number".into()));
        assert!(!is_valid_connection(&"number".into(), &SlotType::Event));
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&vec![
            SlotType::Any,
            SlotType::Event,
            SlotType::named("tensor"),
        ])
        .unwrap();
        assert_eq!(json, r#"[0,-1,"tensor"]"#);

        let parsed: Vec<SlotType> = serde_json::from_str(r#"[0,-1,"","*","number",null]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                SlotType::Any,
                SlotType::Event,
                SlotType::Any,
                SlotType::Any,
                SlotType::named("number"),
                SlotType::Any,
            ]
        );
    }

    #[test]
    fn test_output_links_accept_null() {
        let slot: OutputSlot = serde_json::from_str(r#"{"name":"out","type":"tensor","links":null}"#).unwrap();
        assert!(slot.links().is_empty());
        assert!(slot.data().is_none());
    }
}
