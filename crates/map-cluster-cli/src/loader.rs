//! Input loading: GPX waypoints/track points and JSON point lists

use crate::error::{CliError, Result};
use map_cluster_lib::DataPoint;
use rayon::prelude::*;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Payload carried by every loaded point
pub type Label = Option<String>;

/// One element of a JSON input file
#[derive(Debug, Deserialize)]
struct JsonPoint {
    lat: f64,
    lng: f64,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    label: Option<String>,
}

impl From<JsonPoint> for DataPoint<Label> {
    fn from(point: JsonPoint) -> Self {
        let data = DataPoint::new(point.lat, point.lng, point.label);
        match point.weight {
            Some(weight) => data.with_weight(weight),
            None => data,
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Waypoints and track points of a GPX file; track points are labelled with the track name
pub fn load_gpx(path: &Path) -> Result<Vec<DataPoint<Label>>> {
    let gpx = gpx::read(open(path)?).map_err(|source| CliError::GpxParse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut points: Vec<DataPoint<Label>> = gpx
        .waypoints
        .iter()
        .map(|wp| {
            let p = wp.point();
            DataPoint::new(p.y(), p.x(), wp.name.clone())
        })
        .collect();

    for track in &gpx.tracks {
        for segment in &track.segments {
            points.extend(segment.points.iter().map(|wp| {
                let p = wp.point();
                DataPoint::new(p.y(), p.x(), track.name.clone())
            }));
        }
    }

    if points.is_empty() {
        tracing::warn!("{} contains no waypoints or track points", path.display());
    }
    Ok(points)
}

/// Points of a JSON array file
pub fn load_json(path: &Path) -> Result<Vec<DataPoint<Label>>> {
    let raw: Vec<JsonPoint> =
        serde_json::from_reader(open(path)?).map_err(|source| CliError::JsonParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(raw.into_iter().map(DataPoint::from).collect())
}

/// Load one file, choosing the parser from its extension
pub fn load_file(path: &Path) -> Result<Vec<DataPoint<Label>>> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("gpx") => load_gpx(path),
        Some("json") => load_json(path),
        _ => Err(CliError::UnsupportedFormat(path.to_path_buf())),
    }
}

/// Load every file in parallel, concatenating points in argument order
pub fn load_files(paths: &[PathBuf]) -> Result<Vec<DataPoint<Label>>> {
    let per_file: Vec<Vec<DataPoint<Label>>> = paths
        .par_iter()
        .map(|path| {
            let points = load_file(path)?;
            tracing::debug!("Loaded {} points from {}", points.len(), path.display());
            Ok(points)
        })
        .collect::<Result<_>>()?;

    Ok(per_file.into_iter().flatten().collect())
}
