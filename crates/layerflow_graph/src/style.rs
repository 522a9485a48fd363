// SPDX-License-Identifier: MIT OR Apache-2.0
//! Layout constants shared with the canvas.

/// Height of the node title bar
pub const NODE_TITLE_HEIGHT: f32 = 20.0;
/// Vertical distance between slots
pub const NODE_SLOT_HEIGHT: f32 = 15.0;
/// Minimum node width
pub const NODE_WIDTH: f32 = 140.0;
/// Width of a collapsed node
pub const NODE_COLLAPSED_WIDTH: f32 = 80.0;
/// Font size used to estimate label widths
pub const NODE_TEXT_SIZE: f32 = 14.0;
/// Where new nodes land when nothing else is specified
pub const DEFAULT_POSITION: [f32; 2] = [100.0, 100.0];
/// Default group title font size
pub const DEFAULT_GROUP_FONT: f32 = 24.0;

/// Point-in-rectangle test with exclusive edges
pub fn is_inside_rectangle(x: f32, y: f32, left: f32, top: f32, width: f32, height: f32) -> bool {
    left < x && (left + width) > x && top < y && (top + height) > y
}
