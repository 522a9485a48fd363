// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runner settings.
//!
//! Read from a RON file; every field has a default so a partial file (or no
//! file at all) works.

use layerflow_graph::GraphSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings file looked up in the working directory
pub const SETTINGS_FILE_NAME: &str = "layerflow.ron";

/// What the runner does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Engine settings for the graph
    pub graph: GraphSettings,
    /// Number of steps to run
    pub ticks: usize,
    /// Snapshot to load instead of the demo pipeline
    pub snapshot: Option<PathBuf>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            graph: GraphSettings::default(),
            ticks: 1,
            snapshot: None,
        }
    }
}

impl RunnerSettings {
    /// Parse settings from RON text
    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }

    /// Load settings, falling back to the defaults when the file does not exist
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            tracing::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_ron(&content)?)
    }

    /// Render as pretty RON
    pub fn to_ron(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RunnerSettings::default();
        assert_eq!(settings.ticks, 1);
        assert!(settings.snapshot.is_none());
        assert!(settings.graph.catch_errors);
    }

    #[test]
    fn test_partial_file() {
        let settings = RunnerSettings::from_ron("(ticks: 5, graph: (max_nodes: 20))").unwrap();
        assert_eq!(settings.ticks, 5);
        assert_eq!(settings.graph.max_nodes, 20);
        assert_eq!(settings.graph.fixed_time_lapse, GraphSettings::default().fixed_time_lapse);
    }

    #[test]
    fn test_serialization() {
        let settings = RunnerSettings {
            ticks: 3,
            snapshot: Some(PathBuf::from("graphs/cnn.json")),
            ..RunnerSettings::default()
        };
        let text = settings.to_ron().unwrap();
        assert_eq!(RunnerSettings::from_ron(&text).unwrap(), settings);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let settings = RunnerSettings::load(Path::new("definitely/not/here.ron")).unwrap();
        assert_eq!(settings, RunnerSettings::default());
    }
}
