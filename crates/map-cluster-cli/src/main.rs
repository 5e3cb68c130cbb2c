//! Map Cluster command-line front end
//!
//! Loads points from GPX/JSON files, clusters them and prints the entries visible in a
//! rectangle at one zoom level.

mod error;
mod loader;
mod settings;
mod theme;

use clap::Parser;
use error::Result;
use map_cluster_lib::{ClusterEngine, Entry, SnapshotInfo, present_entries};
use serde::Serialize;
use settings::{OutputFormat, Settings};
use std::io::Write;
use std::process::ExitCode;
use theme::{EntryRecord, JsonTheme, TextTheme};

/// Initialize logging to stderr
///
/// If RUST_LOG is not set, a default filter is installed first.
fn setup_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    if std::env::var("RUST_LOG").is_err() {
        // Safety: single-threaded at startup
        unsafe {
            if cfg!(debug_assertions) {
                std::env::set_var("RUST_LOG", "debug,map_cluster_lib::builder=info");
            } else {
                std::env::set_var("RUST_LOG", "info");
            }
        }
    }

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(fmt_layer).init();
}

#[derive(Serialize)]
struct JsonOutput {
    zoom: u8,
    info: SnapshotInfo,
    entries: Vec<EntryRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<ClusterChildren>,
}

#[derive(Serialize)]
struct ClusterChildren {
    cluster: String,
    children: Vec<EntryRecord>,
}

fn main() -> ExitCode {
    setup_logging();
    let settings = Settings::parse();

    match run(&settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(settings: &Settings) -> Result<()> {
    let points = loader::load_files(&settings.files)?;
    tracing::info!(
        "Loaded {} points from {} files",
        points.len(),
        settings.files.len()
    );

    let engine = ClusterEngine::new(settings.engine_config())?;
    let report = engine.set_data_points(points)?;
    for rejection in &report.rejected {
        tracing::warn!("Skipped point {}: {}", rejection.index, rejection.error);
    }

    // The first query materializes the region of a dynamic-grid engine
    let bounds = settings.query_bounds();
    engine.request_entries(bounds, settings.zoom, false, false)?;
    engine.wait_idle();
    if let Some(err) = engine.take_last_error() {
        return Err(err.into());
    }

    let snapshot = engine.snapshot();
    let zoom = snapshot.clamp_zoom(settings.zoom);
    let entries = engine.request_entries(bounds, zoom, false, true)?;
    let info = snapshot.info();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match settings.format {
        OutputFormat::Text => print_text(&mut out, &info, zoom, &entries, settings.children)?,
        OutputFormat::Json => {
            let theme = JsonTheme {
                max_zoom: snapshot.max_zoom(),
            };
            let children = if settings.children {
                entries
                    .iter()
                    .filter_map(Entry::as_cluster)
                    .map(|cluster| ClusterChildren {
                        cluster: cluster.id().to_string(),
                        children: present_entries(&theme, cluster.children(), zoom),
                    })
                    .collect()
            } else {
                Vec::new()
            };
            let output = JsonOutput {
                zoom,
                info,
                entries: present_entries(&theme, &entries, zoom),
                children,
            };
            serde_json::to_writer_pretty(&mut out, &output)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn print_text(
    out: &mut impl Write,
    info: &SnapshotInfo,
    zoom: u8,
    entries: &[Entry<loader::Label>],
    children: bool,
) -> Result<()> {
    writeln!(
        out,
        "generation {}: {} points (weight {:.2}), {} clusters; zoom {}: {} entries",
        info.generation,
        info.point_count,
        info.total_weight,
        info.cluster_count,
        zoom,
        entries.len()
    )?;

    let lines = present_entries(&TextTheme, entries, zoom);
    for (entry, line) in entries.iter().zip(lines) {
        writeln!(out, "{line}")?;
        if !children {
            continue;
        }
        if let Some(cluster) = entry.as_cluster() {
            for child in present_entries(&TextTheme, cluster.children(), zoom) {
                writeln!(out, "    {child}")?;
            }
        }
    }
    Ok(())
}
