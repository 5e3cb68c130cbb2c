//! Text and JSON presentation of query results

use crate::loader::Label;
use map_cluster_lib::{Cluster, NoisePoint, Theme};
use serde::Serialize;

/// Presents entries as single human-readable lines
#[derive(Debug, Default)]
pub struct TextTheme;

impl Theme<Label> for TextTheme {
    type Visual = String;

    fn present_cluster(&self, cluster: &Cluster<Label>, _zoom: u8) -> String {
        let position = cluster.position();
        format!(
            "cluster {:<8} ({:>10.5}, {:>11.5})  points {:>6}  weight {:>8.2}",
            cluster.id().to_string(),
            position.y(),
            position.x(),
            cluster.point_count(),
            cluster.weight(),
        )
    }

    fn present_noise_point(&self, point: &NoisePoint<Label>, _zoom: u8) -> String {
        let position = point.position();
        format!(
            "point   {:<8} ({:>10.5}, {:>11.5})  weight {:>8.2}  {}",
            point.id().to_string(),
            position.y(),
            position.x(),
            point.weight(),
            point.payload().as_deref().unwrap_or("-"),
        )
    }
}

/// Serializable description of one entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryRecord {
    Cluster {
        id: String,
        lat: f64,
        lng: f64,
        weight: f64,
        point_count: usize,
        max_zoom: u8,
        /// Zoom at which the cluster splits, if within the built range
        expansion_zoom: Option<u8>,
    },
    Point {
        id: String,
        lat: f64,
        lng: f64,
        weight: f64,
        label: Option<String>,
    },
}

/// Presents entries as [`EntryRecord`]s for JSON output
#[derive(Debug)]
pub struct JsonTheme {
    /// Finest zoom of the snapshot, bounding the expansion zoom
    pub max_zoom: u8,
}

impl Theme<Label> for JsonTheme {
    type Visual = EntryRecord;

    fn present_cluster(&self, cluster: &Cluster<Label>, _zoom: u8) -> EntryRecord {
        let position = cluster.position();
        EntryRecord::Cluster {
            id: cluster.id().to_string(),
            lat: position.y(),
            lng: position.x(),
            weight: cluster.weight(),
            point_count: cluster.point_count(),
            max_zoom: cluster.max_zoom(),
            expansion_zoom: cluster
                .max_zoom()
                .checked_add(1)
                .filter(|zoom| *zoom <= self.max_zoom),
        }
    }

    fn present_noise_point(&self, point: &NoisePoint<Label>, _zoom: u8) -> EntryRecord {
        let position = point.position();
        EntryRecord::Point {
            id: point.id().to_string(),
            lat: position.y(),
            lng: position.x(),
            weight: point.weight(),
            label: point.payload().clone(),
        }
    }
}
