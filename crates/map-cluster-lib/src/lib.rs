//! Map Cluster Library - Zoom-aware clustering of weighted geographic points
//!
//! This library groups a dynamic set of weighted points into one clustering per map
//! zoom level, linked into a hierarchy, and answers viewport queries against the latest
//! published result while new results are being built.
//!
//! # Architecture
//!
//! - **[`DataPoint`]**: Immutable weighted point with an opaque payload
//! - **Grid index**: Epsilon-sized cell buckets that make neighbor probing O(1) amortized
//! - **Cluster builder**: Union-find grouping per zoom level, finest to coarsest
//! - **[`ClusterTree`]**: Immutable multi-zoom snapshot with per-level quadtrees
//! - **[`ClusterEngine`]**: Point store, rebuild coordination and snapshot publishing
//! - **[`Theme`]**: Presentation hook implemented by rendering collaborators
//!
//! # Zoom scaling
//!
//! Points are projected onto a unit world plane. At zoom `z` that plane is scaled by
//! `tile_size * 2^z` pixels and `eps` is measured in those pixels, so the geographic
//! radius covered by a fixed epsilon halves with every zoom level.
//!
//! # Performance Characteristics
//!
//! - **Build Time**: O(N × L) for N points and L zoom levels
//! - **Query Time**: O(log D + K) where D=quadtree depth, K=results
//! - **Memory**: O(N) for points + O(E × L) for level tables (E=entries per level)

mod builder;
mod cluster;
mod engine;
mod grid;
mod point;
mod projection;
mod quadtree;
mod store;
mod theme;
mod tree;
pub mod utils;

// Public API exports
pub use cluster::{Cluster, ClusterId, Entry, EntryId, NoisePoint};
pub use engine::{ClusterEngine, Config, RebuildPolicy, Scheduling};
pub use grid::Strategy;
pub use point::{DataPoint, PointError, PointId};
pub use projection::{Equirectangular, Projection, WebMercator};
pub use store::{MutationReport, PointRejection};
pub use theme::{Theme, present_entries};
pub use tree::{ClusterTree, SnapshotInfo};

/// Highest zoom level a configuration may request
pub const MAX_SUPPORTED_ZOOM: u8 = 30;

/// Error types for the clustering engine
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("epsilon {eps} is not valid for the {strategy} strategy: {reason}")]
    InvalidEpsilon {
        strategy: Strategy,
        eps: f64,
        reason: &'static str,
    },

    #[error("minimum weight must be positive and finite, got {0}")]
    InvalidMinWeight(f64),

    #[error("invalid zoom range: min zoom {min} is greater than max zoom {max}")]
    InvalidZoomRange { min: u8, max: u8 },

    #[error("max zoom {0} exceeds the supported limit of {max}", max = MAX_SUPPORTED_ZOOM)]
    ZoomTooLarge(u8),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("rejected point: {0}")]
    InvalidPoint(#[from] PointError),

    #[error("rebuild ran out of memory: {0}")]
    OutOfMemory(#[from] std::collections::TryReserveError),

    #[error("rebuild of generation {0} was cancelled by a newer request")]
    Cancelled(u64),

    /// The store change in `report` took effect; only the follow-up rebuild failed
    #[error("mutation applied but rebuild failed: {source}")]
    RebuildFailed {
        report: MutationReport,
        source: Box<ClusterError>,
    },
}

pub type Result<T> = std::result::Result<T, ClusterError>;
