// SPDX-License-Identifier: MIT OR Apache-2.0
//! `layerflow` - headless graph runner
//!
//! Loads a graph snapshot (or builds a small demo CNN), runs it for a number
//! of steps and prints the resulting snapshot together with the values seen
//! by every watch node.
//!
//! ```text
//! layerflow [--settings FILE] [--ticks N] [--print-settings] [SNAPSHOT.json]
//! ```

mod demo;
mod error;
mod settings;

use clap::Parser;
use error::Result;
use layerflow_graph::catalog::standard_registry;
use layerflow_graph::{Graph, Snapshot};
use settings::{RunnerSettings, SETTINGS_FILE_NAME};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Headless layerflow graph runner
#[derive(Debug, Parser)]
#[command(name = "layerflow")]
#[command(version, about, long_about = None)]
struct Args {
    /// Settings file (RON)
    #[arg(short, long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Number of steps to run, overriding the settings
    #[arg(short, long)]
    ticks: Option<usize>,

    /// Print the effective settings as RON and exit
    #[arg(long)]
    print_settings: bool,

    /// JSON snapshot to load instead of the demo pipeline
    snapshot: Option<PathBuf>,
}

fn main() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("layerflow=info,layerflow_graph=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting layerflow v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run() {
        tracing::error!("layerflow failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE_NAME));
    let mut settings = RunnerSettings::load(&settings_path)?;
    if let Some(ticks) = args.ticks {
        settings.ticks = ticks;
    }
    if args.snapshot.is_some() {
        settings.snapshot.clone_from(&args.snapshot);
    }

    if args.print_settings {
        println!("{}", settings.to_ron()?);
        return Ok(());
    }

    let mut graph = Graph::with_settings(Arc::new(standard_registry()), settings.graph.clone());
    match &settings.snapshot {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            let report = graph.configure(&Snapshot::from_json(&text)?, false);
            if report.had_errors {
                tracing::warn!(
                    "Loaded {} with problems: missing types {:?}, pruned links {:?}",
                    path.display(),
                    report.missing_types,
                    report.pruned_links
                );
            }
        }
        None => {
            demo::build_cnn(&mut graph)?;
        }
    }
    tracing::info!(
        "Graph ready: {} nodes, {} links",
        graph.node_count(),
        graph.link_count()
    );

    graph.start();
    for _ in 0..settings.ticks {
        graph.tick()?;
        if graph.errors_in_execution() {
            break;
        }
    }
    graph.stop();

    println!("{}", graph.serialize_in_order().to_json_pretty()?);
    for node in graph.find_nodes_by_type("basic/watch") {
        let value = node.property("value").cloned().unwrap_or_default();
        println!("{}: {value}", node.title());
    }
    Ok(())
}
