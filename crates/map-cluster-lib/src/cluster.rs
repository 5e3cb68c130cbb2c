//! Clusters, noise points and the entries that reference them
//!
//! Both kinds of node are immutable and shared through `Arc`, so a snapshot can hand
//! them out freely and a later snapshot can reuse an unchanged cluster by reference.
//! The only per-snapshot fact about a node, the coarsest zoom it is shown at, lives in
//! the [`Entry`] wrapping it.

use crate::{DataPoint, PointId, utils};
use geo::{Coord, Point, Rect};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Identifier of a cluster, unique within one engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterId(pub(crate) u64);

impl ClusterId {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Identifier of any hierarchy entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntryId {
    Point(PointId),
    Cluster(ClusterId),
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Point(id) => id.fmt(f),
            EntryId::Cluster(id) => id.fmt(f),
        }
    }
}

/// A stored data point as it appears in the hierarchy
///
/// At the zoom levels where it is not part of any cluster it is a top-level entry
/// (a noise point); elsewhere it is a leaf under some cluster.
#[derive(Debug)]
pub struct NoisePoint<T> {
    id: PointId,
    data: DataPoint<T>,
    /// Position on the unit world plane
    world: Coord<f64>,
}

impl<T> NoisePoint<T> {
    pub(crate) fn new(id: PointId, data: DataPoint<T>, world: Coord<f64>) -> Self {
        Self { id, data, world }
    }

    #[inline]
    pub fn id(&self) -> PointId {
        self.id
    }

    #[inline]
    pub fn data(&self) -> &DataPoint<T> {
        &self.data
    }

    /// Position with `x = lng` and `y = lat`
    #[inline]
    pub fn position(&self) -> Point<f64> {
        self.data.position()
    }

    #[inline]
    pub fn weight(&self) -> f64 {
        self.data.weight()
    }

    #[inline]
    pub fn payload(&self) -> &T {
        self.data.payload()
    }

    /// Position on the unit world plane of the projection that stored the point
    #[inline]
    pub fn world(&self) -> Coord<f64> {
        self.world
    }
}

/// A group of points that reached the minimum weight at some zoom level
#[derive(Debug)]
pub struct Cluster<T> {
    id: ClusterId,
    /// Weighted centroid, `x = lng`, `y = lat`
    position: Point<f64>,
    /// Weighted centroid on the unit world plane
    world: Coord<f64>,
    weight: f64,
    /// Exact cover of all leaf positions
    bounds: Rect<f64>,
    /// Finest zoom at which this grouping exists (the level it formed at)
    max_zoom: u8,
    point_count: usize,
    /// Entries merged at `max_zoom`, sorted by id; each is shown from `max_zoom + 1`
    children: SmallVec<[Entry<T>; 4]>,
}

impl<T> Cluster<T> {
    /// Form a cluster at `zoom` from the entries of the next finer level
    ///
    /// A single heavy point forms a one-child cluster.
    ///
    /// `position` is the geographic image of the weighted world centroid, which the
    /// caller obtains from its projection.
    pub(crate) fn from_children(
        id: ClusterId,
        zoom: u8,
        mut children: SmallVec<[Entry<T>; 4]>,
        unproject: impl FnOnce(Coord<f64>) -> Point<f64>,
    ) -> Self {
        debug_assert!(!children.is_empty(), "a cluster needs at least one child");
        children.sort_by_key(Entry::id);
        let weight = leaf_weight(&children);

        let mut weighted = Coord { x: 0.0, y: 0.0 };
        let mut point_count = 0;
        let mut bounds: Option<Rect<f64>> = None;

        for child in children.iter_mut() {
            child.set_min_zoom(zoom + 1);
            let w = child.weight();
            let world = child.world();
            weighted.x += world.x * w;
            weighted.y += world.y * w;
            point_count += child.point_count();
            bounds = Some(match bounds {
                Some(b) => utils::rect_union(b, child.bounds()),
                None => child.bounds(),
            });
        }

        let world = Coord {
            x: weighted.x / weight,
            y: weighted.y / weight,
        };
        let bounds = bounds.unwrap_or_else(|| utils::point_rect(Point::from(world)));

        Self {
            id,
            position: unproject(world),
            world,
            weight,
            bounds,
            max_zoom: zoom,
            point_count,
            children,
        }
    }

    #[inline]
    pub fn id(&self) -> ClusterId {
        self.id
    }

    /// Weighted centroid with `x = lng` and `y = lat`
    #[inline]
    pub fn position(&self) -> Point<f64> {
        self.position
    }

    #[inline]
    pub fn world(&self) -> Coord<f64> {
        self.world
    }

    /// Sum of the contained point weights
    #[inline]
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Smallest rectangle enclosing every contained point
    #[inline]
    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    /// Finest zoom at which this cluster is shown
    #[inline]
    pub fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    /// Number of leaf points under this cluster
    #[inline]
    pub fn point_count(&self) -> usize {
        self.point_count
    }

    /// Direct children, each shown from `max_zoom() + 1`
    #[inline]
    pub fn children(&self) -> &[Entry<T>] {
        &self.children
    }

    /// Visit every direct child (non-recursive)
    pub fn for_each_entry(&self, mut callback: impl FnMut(&Entry<T>)) {
        for child in &self.children {
            callback(child);
        }
    }

    /// Visit every descendant depth-first, with its depth below this cluster (1 = child)
    pub fn for_each_descendant(&self, mut callback: impl FnMut(&Entry<T>, usize)) {
        self.visit_descendants(1, &mut callback);
    }

    fn visit_descendants(&self, depth: usize, callback: &mut impl FnMut(&Entry<T>, usize)) {
        for child in &self.children {
            callback(child, depth);
            if let Entry::Cluster { cluster, .. } = child {
                cluster.visit_descendants(depth + 1, callback);
            }
        }
    }

    /// Visit every leaf point, regardless of nesting depth
    pub fn for_each_data_point(&self, mut callback: impl FnMut(&NoisePoint<T>)) {
        self.visit_points(&mut callback);
    }

    fn visit_points(&self, callback: &mut impl FnMut(&NoisePoint<T>)) {
        for child in &self.children {
            match child {
                Entry::Cluster { cluster, .. } => cluster.visit_points(callback),
                Entry::Noise { point, .. } => callback(point),
            }
        }
    }

    /// Whether any leaf point satisfies `predicate`, stopping at the first match
    pub fn any_point(&self, predicate: &mut impl FnMut(&NoisePoint<T>) -> bool) -> bool {
        self.children.iter().any(|child| match child {
            Entry::Cluster { cluster, .. } => cluster.any_point(predicate),
            Entry::Noise { point, .. } => predicate(point),
        })
    }

    /// Leaf points in depth-first order, skipping `offset` and returning at most `limit`
    pub fn leaves(&self, limit: usize, offset: usize) -> Vec<Arc<NoisePoint<T>>> {
        let mut out = Vec::with_capacity(limit.min(self.point_count));
        let mut skipped = 0;
        self.collect_leaves(limit, offset, &mut skipped, &mut out);
        out
    }

    fn collect_leaves(
        &self,
        limit: usize,
        offset: usize,
        skipped: &mut usize,
        out: &mut Vec<Arc<NoisePoint<T>>>,
    ) {
        for child in &self.children {
            if out.len() >= limit {
                return;
            }
            match child {
                Entry::Cluster { cluster, .. } => {
                    // Skip whole subtrees that lie before the requested window
                    if *skipped + cluster.point_count <= offset {
                        *skipped += cluster.point_count;
                    } else {
                        cluster.collect_leaves(limit, offset, skipped, out);
                    }
                }
                Entry::Noise { point, .. } => {
                    if *skipped < offset {
                        *skipped += 1;
                    } else {
                        out.push(point.clone());
                    }
                }
            }
        }
    }
}

/// Sum of the leaf weights under `entries`, accumulated depth-first in entry order
///
/// This is the order [`Entry::for_each_data_point`] visits leaves in, so a cluster's
/// weight equals the leaf sum bit for bit.
pub(crate) fn leaf_weight<'a, T: 'a>(entries: impl IntoIterator<Item = &'a Entry<T>>) -> f64 {
    let mut weight = 0.0;
    for entry in entries {
        entry.for_each_data_point(|p| weight += p.weight());
    }
    weight
}

/// A cluster or noise point as visible over a range of zoom levels
#[derive(Debug)]
pub enum Entry<T> {
    Cluster {
        cluster: Arc<Cluster<T>>,
        /// Coarsest zoom at which the cluster is shown
        min_zoom: u8,
    },
    Noise {
        point: Arc<NoisePoint<T>>,
        /// Coarsest zoom at which the point is shown on its own
        min_zoom: u8,
    },
}

// Manual impl: cloning only bumps reference counts, so `T` needs no `Clone` bound.
impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        match self {
            Entry::Cluster { cluster, min_zoom } => Entry::Cluster {
                cluster: cluster.clone(),
                min_zoom: *min_zoom,
            },
            Entry::Noise { point, min_zoom } => Entry::Noise {
                point: point.clone(),
                min_zoom: *min_zoom,
            },
        }
    }
}

impl<T> Entry<T> {
    pub(crate) fn cluster(cluster: Arc<Cluster<T>>, min_zoom: u8) -> Self {
        Entry::Cluster { cluster, min_zoom }
    }

    pub(crate) fn noise(point: Arc<NoisePoint<T>>, min_zoom: u8) -> Self {
        Entry::Noise { point, min_zoom }
    }

    pub(crate) fn set_min_zoom(&mut self, zoom: u8) {
        match self {
            Entry::Cluster { min_zoom, .. } | Entry::Noise { min_zoom, .. } => *min_zoom = zoom,
        }
    }

    #[inline]
    pub fn id(&self) -> EntryId {
        match self {
            Entry::Cluster { cluster, .. } => EntryId::Cluster(cluster.id),
            Entry::Noise { point, .. } => EntryId::Point(point.id),
        }
    }

    /// Coarsest zoom at which this entry is shown
    #[inline]
    pub fn min_zoom(&self) -> u8 {
        match self {
            Entry::Cluster { min_zoom, .. } | Entry::Noise { min_zoom, .. } => *min_zoom,
        }
    }

    /// Finest zoom at which this entry is shown; `None` for noise points
    #[inline]
    pub fn max_zoom(&self) -> Option<u8> {
        match self {
            Entry::Cluster { cluster, .. } => Some(cluster.max_zoom),
            Entry::Noise { .. } => None,
        }
    }

    /// Whether the entry belongs to the flat result of `zoom`
    #[inline]
    pub fn visible_at(&self, zoom: u8) -> bool {
        zoom >= self.min_zoom() && self.max_zoom().is_none_or(|max| zoom <= max)
    }

    #[inline]
    pub fn weight(&self) -> f64 {
        match self {
            Entry::Cluster { cluster, .. } => cluster.weight,
            Entry::Noise { point, .. } => point.weight(),
        }
    }

    /// Position with `x = lng` and `y = lat`
    #[inline]
    pub fn position(&self) -> Point<f64> {
        match self {
            Entry::Cluster { cluster, .. } => cluster.position,
            Entry::Noise { point, .. } => point.position(),
        }
    }

    #[inline]
    pub fn world(&self) -> Coord<f64> {
        match self {
            Entry::Cluster { cluster, .. } => cluster.world,
            Entry::Noise { point, .. } => point.world,
        }
    }

    /// Exact cover of the contained points (degenerate for a noise point)
    #[inline]
    pub fn bounds(&self) -> Rect<f64> {
        match self {
            Entry::Cluster { cluster, .. } => cluster.bounds,
            Entry::Noise { point, .. } => utils::point_rect(point.position()),
        }
    }

    /// Number of leaf points represented by this entry
    #[inline]
    pub fn point_count(&self) -> usize {
        match self {
            Entry::Cluster { cluster, .. } => cluster.point_count,
            Entry::Noise { .. } => 1,
        }
    }

    #[inline]
    pub fn is_cluster(&self) -> bool {
        matches!(self, Entry::Cluster { .. })
    }

    #[inline]
    pub fn as_cluster(&self) -> Option<&Arc<Cluster<T>>> {
        match self {
            Entry::Cluster { cluster, .. } => Some(cluster),
            Entry::Noise { .. } => None,
        }
    }

    #[inline]
    pub fn as_noise(&self) -> Option<&Arc<NoisePoint<T>>> {
        match self {
            Entry::Noise { point, .. } => Some(point),
            Entry::Cluster { .. } => None,
        }
    }

    /// Visit every leaf point represented by this entry
    pub fn for_each_data_point(&self, mut callback: impl FnMut(&NoisePoint<T>)) {
        match self {
            Entry::Cluster { cluster, .. } => cluster.visit_points(&mut callback),
            Entry::Noise { point, .. } => callback(point),
        }
    }

    /// Whether any leaf point satisfies `predicate`
    pub fn any_point(&self, mut predicate: impl FnMut(&NoisePoint<T>) -> bool) -> bool {
        match self {
            Entry::Cluster { cluster, .. } => cluster.any_point(&mut predicate),
            Entry::Noise { point, .. } => predicate(point),
        }
    }
}
