// SPDX-License-Identifier: MIT OR Apache-2.0
//! Visual groups. They frame nodes on the canvas and have no effect on execution.

use crate::node::Node;
use crate::style;
use serde::{Deserialize, Serialize};

/// A titled rectangle drawn behind nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Group title
    #[serde(default)]
    pub title: String,
    /// `[x, y, width, height]`
    pub bounding: [f32; 4],
    /// Custom color
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Title font size
    #[serde(rename = "font", default = "default_font")]
    pub font_size: f32,
}

fn default_font() -> f32 {
    style::DEFAULT_GROUP_FONT
}

impl Group {
    /// Create a group with the default frame
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            bounding: [10.0, 10.0, 140.0, 80.0],
            color: None,
            font_size: style::DEFAULT_GROUP_FONT,
        }
    }

    /// Set the frame
    pub fn with_bounding(mut self, bounding: [f32; 4]) -> Self {
        self.bounding = bounding;
        self
    }

    /// Top-left corner
    pub fn pos(&self) -> [f32; 2] {
        [self.bounding[0], self.bounding[1]]
    }

    /// Width and height
    pub fn size(&self) -> [f32; 2] {
        [self.bounding[2], self.bounding[3]]
    }

    /// Hit test in graph space
    pub fn is_point_inside(&self, x: f32, y: f32, margin: f32) -> bool {
        style::is_inside_rectangle(
            x,
            y,
            self.bounding[0] - margin,
            self.bounding[1] - margin,
            self.bounding[2] + 2.0 * margin,
            self.bounding[3] + 2.0 * margin,
        )
    }

    /// Whether the centre of a node lies inside this group
    pub fn contains_node(&self, node: &Node) -> bool {
        let [x, y, w, h] = node.bounding();
        self.is_point_inside(x + w * 0.5, y + h * 0.5, 0.0)
    }
}
