// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph engine settings.
//!
//! Settings are plain serde data so embedders can keep them in a RON file
//! next to their other project configuration.

use serde::{Deserialize, Serialize};

/// Node count guard, avoids runaway graph construction
pub const DEFAULT_MAX_NODES: usize = 1000;

/// Simulation time added per iteration
pub const DEFAULT_FIXED_TIME_LAPSE: f64 = 0.01;

/// Tunables for a [`Graph`](crate::Graph)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    /// Maximum number of nodes a graph accepts
    pub max_nodes: usize,
    /// Amount `fixed_time` advances per iteration
    pub fixed_time_lapse: f64,
    /// Whether [`Graph::tick`](crate::Graph::tick) swallows execution errors
    pub catch_errors: bool,
    /// Snap nodes to the grid when they are added
    pub align_to_grid: bool,
    /// Grid cell size in graph units
    pub grid_size: f32,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES,
            fixed_time_lapse: DEFAULT_FIXED_TIME_LAPSE,
            catch_errors: true,
            align_to_grid: false,
            grid_size: 10.0,
        }
    }
}

impl GraphSettings {
    /// Parse settings from RON text; missing fields keep their defaults
    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }

    /// Render settings as pretty RON
    pub fn to_ron(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }
}
