use clap::{Parser, ValueEnum};
use geo::Rect;
use map_cluster_lib::{Config, RebuildPolicy, Scheduling, Strategy, utils};
use std::path::PathBuf;

/// How query results are printed
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// One line per entry
    #[default]
    Text,
    /// A JSON document with the snapshot summary and every entry
    Json,
}

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Map Cluster - Cluster weighted geographic points and query them per zoom level
pub struct Settings {
    /// GPX or JSON files to load (JSON: array of {lat, lng, weight?, label?})
    #[clap(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,

    /// Grouping strategy (fast-grid, grid, dynamic-grid)
    #[clap(short, long, default_value = "fast-grid")]
    pub strategy: Strategy,

    /// Merge distance in pixels (power of two up to 256 for fast-grid, 10-127 otherwise)
    #[clap(short, long, default_value = "64")]
    pub eps: f64,

    /// Minimum summed weight for a group to become a cluster
    #[clap(long, default_value = "2.0")]
    pub min_weight: f64,

    /// Coarsest zoom level to build
    #[clap(long, default_value = "0")]
    pub min_zoom: u8,

    /// Finest zoom level to build
    #[clap(long, default_value = "22")]
    pub max_zoom: u8,

    /// World size in pixels at zoom 0
    #[clap(long, default_value = "256")]
    pub tile_size: f64,

    /// Viewport margin for dynamic-grid builds, as a fraction of the viewport
    #[clap(long, default_value = "0.25")]
    pub viewport_margin: f64,

    /// Zoom level to query
    #[clap(short, long, default_value = "10")]
    pub zoom: u8,

    /// Query rectangle as min_lat,min_lng,max_lat,max_lng (default: whole world)
    #[clap(short, long, value_name = "BBOX", value_parser = parse_bbox, allow_hyphen_values = true)]
    pub bbox: Option<Rect<f64>>,

    /// Build on the background pool instead of the calling thread
    #[clap(long, default_value = "false")]
    pub background: bool,

    /// Output format
    #[clap(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Also list the direct children of every cluster
    #[clap(long, default_value = "false")]
    pub children: bool,
}

impl Settings {
    /// Engine configuration described by these settings
    pub fn engine_config(&self) -> Config {
        Config {
            eps: self.eps,
            min_weight: self.min_weight,
            strategy: self.strategy,
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            tile_size: self.tile_size,
            viewport_margin: self.viewport_margin,
            scheduling: if self.background {
                Scheduling::Background
            } else {
                Scheduling::Inline
            },
            rebuild_policy: RebuildPolicy::Cancel,
        }
    }

    /// Rectangle to query
    pub fn query_bounds(&self) -> Rect<f64> {
        self.bbox.unwrap_or_else(utils::world_bounds)
    }
}

/// Parse `min_lat,min_lng,max_lat,max_lng`
pub fn parse_bbox(value: &str) -> Result<Rect<f64>, String> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid number in bbox '{value}': {e}"))?;

    let [min_lat, min_lng, max_lat, max_lng] = parts[..] else {
        return Err(format!(
            "expected 4 comma separated values, got {}",
            parts.len()
        ));
    };
    if min_lat > max_lat || min_lng > max_lng {
        return Err(format!("bbox minimum exceeds maximum in '{value}'"));
    }
    Ok(utils::lat_lng_rect(min_lat, min_lng, max_lat, max_lng))
}
