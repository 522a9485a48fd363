// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runner errors.

use layerflow_graph::{ConnectionError, GraphError, SnapshotError};
use thiserror::Error;

/// Anything that stops the runner
#[derive(Debug, Error)]
pub enum AppError {
    /// File could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file is not valid RON
    #[error("Settings error: {0}")]
    Settings(#[from] ron::error::SpannedError),

    /// Settings could not be rendered
    #[error("Settings encoding error: {0}")]
    SettingsEncoding(#[from] ron::Error),

    /// Snapshot could not be parsed or rendered
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Graph construction or execution failed
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Demo pipeline could not be wired
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Result type for the runner
pub type Result<T> = std::result::Result<T, AppError>;
