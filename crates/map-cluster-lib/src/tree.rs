//! Immutable multi-zoom cluster snapshots
//!
//! A [`ClusterTree`] is the output of one build pass. Every distinct entry (point or
//! cluster) is stored once in an arena together with the coarsest zoom it is shown at;
//! each zoom level lists the arena slots visible there and indexes their bounds in a
//! quadtree. Snapshots are never mutated after publishing, so readers can keep using an
//! old one while a newer one is being built.

use crate::cluster::{Cluster, Entry, EntryId, NoisePoint};
use crate::quadtree::Quadtree;
use crate::utils;
use geo::Rect;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Statistics about a snapshot
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SnapshotInfo {
    /// Store generation the snapshot reflects
    pub generation: u64,
    /// Number of data points in the snapshot
    pub point_count: usize,
    /// Sum of all data point weights
    pub total_weight: f64,
    /// Number of distinct clusters across all zoom levels
    pub cluster_count: usize,
    /// Number of top-level entries per zoom, coarsest first
    pub entries_per_zoom: Vec<(u8, usize)>,
}

/// Which part of the world a snapshot has grouped
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Coverage {
    /// Every stored point
    World,
    /// Only points inside the region
    Region(Rect<f64>),
    /// Nothing has been requested yet
    Nothing,
}

/// Entries visible at one zoom level
#[derive(Debug)]
pub(crate) struct Level {
    /// Arena slots, in build order
    pub(crate) members: Vec<u32>,
    pub(crate) index: Quadtree,
}

/// One published clustering of the point set, for every configured zoom level
#[derive(Debug)]
pub struct ClusterTree<T> {
    generation: u64,
    min_zoom: u8,
    max_zoom: u8,
    coverage: Coverage,
    /// Every distinct entry, with the coarsest zoom it is shown at
    entries: Vec<Entry<T>>,
    /// One level per zoom, `levels[0]` is `min_zoom`
    levels: Vec<Level>,
    ids: HashMap<EntryId, u32>,
    /// Clusters keyed by the zoom they formed at and their first child
    formations: HashMap<(u8, EntryId), u32>,
    point_count: usize,
    total_weight: f64,
}

/// Pieces a builder hands over to form a snapshot
pub(crate) struct TreeParts<T> {
    pub(crate) generation: u64,
    pub(crate) min_zoom: u8,
    pub(crate) max_zoom: u8,
    pub(crate) coverage: Coverage,
    pub(crate) entries: Vec<Entry<T>>,
    pub(crate) levels: Vec<Level>,
    pub(crate) formations: HashMap<(u8, EntryId), u32>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<T> ClusterTree<T> {
    /// A snapshot without entries
    pub(crate) fn empty(generation: u64, min_zoom: u8, max_zoom: u8, coverage: Coverage) -> Self {
        let levels = (min_zoom..=max_zoom)
            .map(|_| Level {
                members: Vec::new(),
                index: Quadtree::new(),
            })
            .collect();
        Self::from_parts(TreeParts {
            generation,
            min_zoom,
            max_zoom,
            coverage,
            entries: Vec::new(),
            levels,
            formations: HashMap::new(),
        })
    }

    pub(crate) fn from_parts(parts: TreeParts<T>) -> Self {
        debug_assert_eq!(
            parts.levels.len(),
            usize::from(parts.max_zoom - parts.min_zoom) + 1
        );

        let ids = parts
            .entries
            .iter()
            .enumerate()
            .map(|(slot, entry)| (entry.id(), slot as u32))
            .collect();

        let (point_count, total_weight) = parts
            .entries
            .iter()
            .filter(|entry| !entry.is_cluster())
            .fold((0, 0.0), |(count, weight), entry| {
                (count + 1, weight + entry.weight())
            });

        Self {
            generation: parts.generation,
            min_zoom: parts.min_zoom,
            max_zoom: parts.max_zoom,
            coverage: parts.coverage,
            entries: parts.entries,
            levels: parts.levels,
            ids,
            formations: parts.formations,
            point_count,
            total_weight,
        }
    }

    /// Store generation this snapshot reflects
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    #[inline]
    pub fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    /// Clamp a requested zoom into the configured range
    #[inline]
    pub fn clamp_zoom(&self, zoom: u8) -> u8 {
        zoom.clamp(self.min_zoom, self.max_zoom)
    }

    /// Geographic region the snapshot was restricted to, if any
    pub fn region(&self) -> Option<Rect<f64>> {
        match self.coverage {
            Coverage::Region(region) => Some(region),
            Coverage::World | Coverage::Nothing => None,
        }
    }

    /// Whether every point inside `bounds` was part of this build
    pub fn covers(&self, bounds: Rect<f64>) -> bool {
        match self.coverage {
            Coverage::World => true,
            Coverage::Region(region) => utils::rect_contains(region, bounds),
            Coverage::Nothing => false,
        }
    }

    /// Number of data points grouped by this snapshot
    #[inline]
    pub fn point_count(&self) -> usize {
        self.point_count
    }

    #[inline]
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.point_count == 0
    }

    fn level(&self, zoom: u8) -> &Level {
        &self.levels[usize::from(self.clamp_zoom(zoom) - self.min_zoom)]
    }

    /// Entries visible at `zoom` whose bounds intersect `bounds`, in build order
    pub fn query(&self, bounds: Rect<f64>, zoom: u8) -> Vec<Entry<T>> {
        self.query_filtered(bounds, zoom, |_| true)
    }

    /// Like [`query`](Self::query), keeping only entries accepted by `filter`
    pub fn query_filtered(
        &self,
        bounds: Rect<f64>,
        zoom: u8,
        mut filter: impl FnMut(&Entry<T>) -> bool,
    ) -> Vec<Entry<T>> {
        let zoom = self.clamp_zoom(zoom);
        let level = self.level(zoom);

        if level.index.is_empty() {
            return Vec::new();
        }

        let mut slots = Vec::new();
        level.index.query(bounds, &mut slots);
        slots.sort_unstable();

        slots
            .into_iter()
            .map(|slot| &self.entries[slot as usize])
            .filter(|entry| {
                debug_assert!(entry.visible_at(zoom));
                filter(*entry)
            })
            .cloned()
            .collect()
    }

    /// Visit every top-level entry of `zoom` (non-recursive)
    pub fn for_each_entry(&self, zoom: u8, mut callback: impl FnMut(&Entry<T>)) {
        for &slot in &self.level(zoom).members {
            callback(&self.entries[slot as usize]);
        }
    }

    /// All top-level entries of `zoom`
    pub fn entries_at(&self, zoom: u8) -> Vec<Entry<T>> {
        let mut out = Vec::with_capacity(self.level(zoom).members.len());
        self.for_each_entry(zoom, |entry| out.push(entry.clone()));
        out
    }

    /// Visit every data point of the snapshot
    pub fn for_each_data_point(&self, mut callback: impl FnMut(&NoisePoint<T>)) {
        // The coarsest level reaches every point through the hierarchy
        self.for_each_entry(self.min_zoom, |entry| {
            entry.for_each_data_point(&mut callback)
        });
    }

    /// Entry with `id`, regardless of zoom
    pub fn get(&self, id: EntryId) -> Option<&Entry<T>> {
        self.ids.get(&id).map(|&slot| &self.entries[slot as usize])
    }

    /// Entry with `id` if it is a top-level entry at `zoom`
    pub fn find(&self, id: EntryId, zoom: u8) -> Option<&Entry<T>> {
        let zoom = self.clamp_zoom(zoom);
        self.get(id).filter(|entry| entry.visible_at(zoom))
    }

    /// Zoom at which `cluster` splits into its children, `None` past the finest level
    pub fn expansion_zoom(&self, cluster: &Cluster<T>) -> Option<u8> {
        cluster
            .max_zoom()
            .checked_add(1)
            .filter(|zoom| *zoom <= self.max_zoom)
    }

    /// Cluster formed at `zoom` whose smallest child id is `first_child`
    pub(crate) fn formation(&self, zoom: u8, first_child: EntryId) -> Option<&Arc<Cluster<T>>> {
        self.formations
            .get(&(zoom, first_child))
            .and_then(|&slot| self.entries[slot as usize].as_cluster())
    }

    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            generation: self.generation,
            point_count: self.point_count,
            total_weight: self.total_weight,
            cluster_count: self.entries.len() - self.point_count,
            entries_per_zoom: (self.min_zoom..=self.max_zoom)
                .zip(&self.levels)
                .map(|(zoom, level)| (zoom, level.members.len()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildRequest, ClusterBuilder};
    use crate::grid::GridSpec;
    use crate::{DataPoint, PointId, Strategy, WebMercator};
    use std::sync::atomic::AtomicU64;

    fn points(coords: &[(f64, f64, f64)]) -> Vec<Arc<NoisePoint<usize>>> {
        coords
            .iter()
            .enumerate()
            .map(|(i, &(lat, lng, weight))| {
                let world = crate::Projection::lat_lng_to_point(&WebMercator, lat, lng);
                Arc::new(NoisePoint::new(
                    PointId(i as u64),
                    DataPoint::new(lat, lng, i).with_weight(weight),
                    world,
                ))
            })
            .collect()
    }

    fn build(coords: &[(f64, f64)], eps: f64) -> ClusterTree<usize> {
        let weighted: Vec<(f64, f64, f64)> =
            coords.iter().map(|&(lat, lng)| (lat, lng, 1.0)).collect();
        build_weighted(&weighted, eps, 2.0)
    }

    fn build_weighted(coords: &[(f64, f64, f64)], eps: f64, min_weight: f64) -> ClusterTree<usize> {
        let spec = GridSpec::new(Strategy::FastGrid, eps).unwrap();
        let ids = AtomicU64::new(0);
        let builder = ClusterBuilder {
            spec,
            projection: &WebMercator,
            min_zoom: 0,
            max_zoom: 22,
            tile_size: 256.0,
            min_weight,
            cluster_ids: &ids,
        };
        builder
            .build(
                BuildRequest {
                    generation: 1,
                    points: points(coords),
                    coverage: Coverage::World,
                    prior: None,
                },
                &|| false,
            )
            .unwrap()
    }

    fn fixture() -> ClusterTree<usize> {
        build(&[(0.0, 0.0), (0.0, 0.0001), (10.0, 10.0)], 64.0)
    }

    fn world() -> Rect<f64> {
        utils::world_bounds()
    }

    #[test]
    fn test_regression_fixture() {
        let tree = fixture();

        let at_20 = tree.query(world(), 20);
        assert_eq!(at_20.len(), 3);
        assert!(at_20.iter().all(|e| !e.is_cluster()));

        let at_10 = tree.query(world(), 10);
        assert_eq!(at_10.len(), 2);
        let cluster = at_10.iter().find(|e| e.is_cluster()).unwrap();
        assert_eq!(cluster.weight(), 2.0);
        assert_eq!(cluster.max_zoom(), Some(19));
        assert_eq!(cluster.min_zoom(), 3);
        assert_eq!(at_10.iter().filter(|e| !e.is_cluster()).count(), 1);

        let at_0 = tree.query(world(), 0);
        assert_eq!(at_0.len(), 1);
        assert!(at_0[0].is_cluster());
        assert_eq!(at_0[0].weight(), 3.0);
        assert_eq!(at_0[0].max_zoom(), Some(2));
        assert_eq!(at_0[0].min_zoom(), 0);
    }

    #[test]
    fn test_zoom_ranges_hold_for_every_level() {
        let tree = fixture();
        for zoom in 0..=22 {
            for entry in tree.query(world(), zoom) {
                assert!(entry.min_zoom() <= zoom);
                if let Some(max) = entry.max_zoom() {
                    assert!(zoom <= max);
                }
            }
        }
    }

    #[test]
    fn test_children_start_after_parent() {
        let tree = fixture();
        tree.for_each_entry(0, |entry| {
            let cluster = entry.as_cluster().unwrap();
            cluster.for_each_descendant(|child, _| {
                assert!(child.min_zoom() > 0);
            });
            for child in cluster.children() {
                assert_eq!(child.min_zoom(), cluster.max_zoom() + 1);
            }
        });
    }

    #[test]
    fn test_cluster_weight_equals_leaf_weight() {
        let coords: Vec<(f64, f64, f64)> = (0..300)
            .map(|i| {
                let lat = ((i * 37) % 120) as f64 * 0.5 - 30.0;
                let lng = ((i * 53) % 300) as f64 - 150.0;
                (lat, lng, 0.1 * ((i % 7) + 1) as f64)
            })
            .collect();
        let expected: f64 = coords.iter().map(|&(_, _, w)| w).sum();
        let tree = build_weighted(&coords, 32.0, 0.5);
        for zoom in 0..=22 {
            let mut total = 0.0;
            for entry in tree.entries_at(zoom) {
                let mut leaf_weight = 0.0;
                entry.for_each_data_point(|p| leaf_weight += p.weight());
                assert_eq!(entry.weight(), leaf_weight, "zoom {zoom} entry {}", entry.id());
                total += entry.weight();
            }
            assert!((total - expected).abs() < 1e-9, "zoom {zoom} lost weight");
        }
    }

    #[test]
    fn test_bounds_are_exact_cover() {
        let tree = fixture();
        let root = tree.entries_at(0).remove(0);
        let bounds = root.bounds();
        assert_eq!(bounds.min().x, 0.0);
        assert_eq!(bounds.min().y, 0.0);
        assert_eq!(bounds.max().x, 10.0);
        assert_eq!(bounds.max().y, 10.0);
    }

    #[test]
    fn test_idempotent_builds() {
        let shape = |tree: &ClusterTree<usize>| {
            (0..=22)
                .map(|zoom| {
                    tree.entries_at(zoom)
                        .iter()
                        .map(|e| {
                            let mut leaves = Vec::new();
                            e.for_each_data_point(|p| leaves.push(p.id()));
                            (e.is_cluster(), e.min_zoom(), e.max_zoom(), leaves)
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };
        let coords = [(0.0, 0.0), (0.0, 0.0001), (10.0, 10.0), (-33.0, 151.0)];
        assert_eq!(shape(&build(&coords, 64.0)), shape(&build(&coords, 64.0)));
    }

    #[test]
    fn test_query_bounds_filter() {
        let tree = fixture();
        let near_origin = utils::lat_lng_rect(-1.0, -1.0, 1.0, 1.0);
        let at_20 = tree.query(near_origin, 20);
        assert_eq!(at_20.len(), 2);

        // The root cluster's bounds reach the origin
        assert_eq!(tree.query(near_origin, 0).len(), 1);

        let far = utils::lat_lng_rect(-60.0, -60.0, -50.0, -50.0);
        assert!(tree.query(far, 0).is_empty());
    }

    #[test]
    fn test_zoom_is_clamped() {
        let tree = fixture();
        assert_eq!(tree.query(world(), 30).len(), 3);
        assert_eq!(tree.clamp_zoom(40), 22);
    }

    #[test]
    fn test_find_and_expansion_zoom() {
        let tree = fixture();
        let root = tree.entries_at(0).remove(0);
        let cluster = root.as_cluster().unwrap();
        assert_eq!(tree.expansion_zoom(cluster), Some(3));
        assert!(tree.find(root.id(), 1).is_some());
        assert!(tree.find(root.id(), 3).is_none());

        let point = EntryId::Point(PointId(2));
        assert!(tree.find(point, 2).is_none());
        assert!(tree.find(point, 3).is_some());
        assert!(tree.get(point).is_some());
    }

    #[test]
    fn test_info() {
        let tree = fixture();
        let info = tree.info();
        assert_eq!(info.generation, 1);
        assert_eq!(info.point_count, 3);
        assert_eq!(info.total_weight, 3.0);
        assert_eq!(info.cluster_count, 2);
        assert_eq!(info.entries_per_zoom.len(), 23);
        assert_eq!(info.entries_per_zoom[0], (0, 1));
        assert_eq!(info.entries_per_zoom[22], (22, 3));
    }

    #[test]
    fn test_for_each_data_point_visits_every_point_once() {
        let tree = fixture();
        let mut seen = Vec::new();
        tree.for_each_data_point(|p| seen.push(p.id()));
        seen.sort();
        assert_eq!(seen, vec![PointId(0), PointId(1), PointId(2)]);
    }

    #[test]
    fn test_empty_snapshot() {
        let tree: ClusterTree<()> = ClusterTree::empty(0, 0, 22, Coverage::World);
        assert!(tree.is_empty());
        assert!(tree.query(world(), 5).is_empty());
        assert_eq!(tree.info().cluster_count, 0);
        assert!(tree.covers(world()));

        let nothing: ClusterTree<()> = ClusterTree::empty(0, 0, 22, Coverage::Nothing);
        assert!(!nothing.covers(utils::lat_lng_rect(0.0, 0.0, 1.0, 1.0)));
    }
}
