//! Multi-zoom cluster building
//!
//! Levels are grouped from the finest zoom to the coarsest. Each level starts from the
//! entries of the next finer one, unions every pair within `eps` pixels and turns the
//! resulting components into clusters when they are heavy enough.

use crate::cluster::{Cluster, ClusterId, Entry, EntryId, NoisePoint, leaf_weight};
use crate::grid::{GridIndex, GridSpec};
use crate::quadtree::Quadtree;
use crate::tree::{ClusterTree, Coverage, Level, TreeParts};
use crate::{ClusterError, Projection, Result, Strategy};
use geo::Coord;
use rayon::prelude::*;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Union-find over an arena of integer parent indices
#[derive(Debug)]
pub(crate) struct DisjointSet {
    parent: Vec<u32>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub(crate) fn new(len: usize) -> Result<Self> {
        let mut parent = Vec::new();
        parent.try_reserve_exact(len)?;
        parent.extend(0..len as u32);

        let mut rank = Vec::new();
        rank.try_reserve_exact(len)?;
        rank.resize(len, 0);

        Ok(Self { parent, rank })
    }

    /// Representative of `x`, halving the path on the way up
    pub(crate) fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grandparent = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grandparent;
            x = grandparent;
        }
        x
    }

    /// Merge the sets of `a` and `b`; returns whether they were separate
    pub(crate) fn union(&mut self, a: u32, b: u32) -> bool {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return false;
        }
        let (low, high) = if self.rank[a as usize] < self.rank[b as usize] {
            (a, b)
        } else {
            (b, a)
        };
        self.parent[low as usize] = high;
        if self.rank[low as usize] == self.rank[high as usize] {
            self.rank[high as usize] += 1;
        }
        true
    }

    /// All sets, each listing its members in ascending order, ordered by first member
    pub(crate) fn groups(&mut self) -> Vec<SmallVec<[u32; 4]>> {
        const UNSEEN: u32 = u32::MAX;
        let mut group_of_root = vec![UNSEEN; self.parent.len()];
        let mut groups: Vec<SmallVec<[u32; 4]>> = Vec::new();

        for x in 0..self.parent.len() as u32 {
            let root = self.find(x) as usize;
            if group_of_root[root] == UNSEEN {
                group_of_root[root] = groups.len() as u32;
                groups.push(SmallVec::new());
            }
            groups[group_of_root[root] as usize].push(x);
        }
        groups
    }
}

/// Input of one build pass
pub(crate) struct BuildRequest<'a, T> {
    /// Store generation the result will be tagged with
    pub(crate) generation: u64,
    /// Points to group, in id order
    pub(crate) points: Vec<Arc<NoisePoint<T>>>,
    pub(crate) coverage: Coverage,
    /// Snapshot whose clusters may be reused when the same group forms again
    pub(crate) prior: Option<&'a ClusterTree<T>>,
}

/// Groups points into one clustering per zoom level
pub(crate) struct ClusterBuilder<'a> {
    pub(crate) spec: GridSpec,
    pub(crate) projection: &'a dyn Projection,
    pub(crate) min_zoom: u8,
    pub(crate) max_zoom: u8,
    pub(crate) tile_size: f64,
    pub(crate) min_weight: f64,
    /// Shared source of cluster ids, so ids stay unique across snapshots
    pub(crate) cluster_ids: &'a AtomicU64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl ClusterBuilder<'_> {
    /// Build a snapshot, checking `cancelled` before every level
    pub(crate) fn build<T: Send + Sync>(
        &self,
        request: BuildRequest<'_, T>,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<ClusterTree<T>> {
        let BuildRequest {
            generation,
            points,
            coverage,
            prior,
        } = request;
        let point_count = points.len();

        // Every cluster absorbs at least two entries, so the arena never exceeds 2n
        let mut entries: Vec<Entry<T>> = Vec::new();
        entries.try_reserve(point_count.saturating_mul(2))?;
        entries.extend(points.into_iter().map(|p| Entry::noise(p, self.min_zoom)));

        let mut formations = HashMap::new();
        let track_formations = self.spec.strategy() == Strategy::DynamicGrid;

        let level_count = usize::from(self.max_zoom - self.min_zoom) + 1;
        let mut finest_first: Vec<Vec<u32>> = Vec::new();
        finest_first.try_reserve_exact(level_count)?;

        let raw: Vec<u32> = (0..point_count as u32).collect();
        for zoom in (self.min_zoom..=self.max_zoom).rev() {
            if cancelled() {
                tracing::debug!("Build of generation {} cancelled at zoom {}", generation, zoom);
                return Err(ClusterError::Cancelled(generation));
            }

            let input = finest_first.last().unwrap_or(&raw);
            let next = self.group_level(
                zoom,
                input,
                &mut entries,
                prior,
                track_formations.then_some(&mut formations),
            )?;
            tracing::trace!("Zoom {}: {} entries grouped into {}", zoom, input.len(), next.len());
            finest_first.push(next);
        }
        finest_first.reverse();

        let levels: Vec<Level> = {
            #[cfg(feature = "profiling")]
            profiling::scope!("builder::index_levels");
            let entries = &entries;
            finest_first
                .into_par_iter()
                .map(|members| {
                    let index = Quadtree::from_items(
                        members
                            .iter()
                            .map(|&slot| (slot, entries[slot as usize].bounds())),
                    );
                    Level { members, index }
                })
                .collect()
        };

        tracing::debug!(
            "Built generation {}: {} points, {} clusters over zooms {}..={}",
            generation,
            point_count,
            entries.len() - point_count,
            self.min_zoom,
            self.max_zoom
        );

        Ok(ClusterTree::from_parts(TreeParts {
            generation,
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            coverage,
            entries,
            levels,
            formations,
        }))
    }

    /// Group the entries of the next finer level at `zoom`, returning the new level
    fn group_level<T>(
        &self,
        zoom: u8,
        input: &[u32],
        entries: &mut Vec<Entry<T>>,
        prior: Option<&ClusterTree<T>>,
        mut formations: Option<&mut HashMap<(u8, EntryId), u32>>,
    ) -> Result<Vec<u32>> {
        let scale = self.tile_size * 2f64.powi(i32::from(zoom));
        let mut pixels: Vec<Coord<f64>> = Vec::new();
        pixels.try_reserve_exact(input.len())?;
        pixels.extend(input.iter().map(|&slot| {
            let world = entries[slot as usize].world();
            Coord {
                x: world.x * scale,
                y: world.y * scale,
            }
        }));

        let mut grid = GridIndex::with_capacity(self.spec, input.len())?;
        for (i, &pixel) in pixels.iter().enumerate() {
            grid.insert(i as u32, pixel);
        }
        tracing::trace!("Zoom {}: {} entries in {} cells", zoom, grid.len(), grid.cell_count());

        let eps_sq = self.spec.eps() * self.spec.eps();
        let mut sets = DisjointSet::new(input.len())?;
        for (i, &pixel) in pixels.iter().enumerate() {
            // Removing first means every pair is examined from one side only
            grid.remove(i as u32, pixel);
            for j in grid.neighbors_of(pixel) {
                let other = pixels[j as usize];
                let (dx, dy) = (pixel.x - other.x, pixel.y - other.y);
                if dx * dx + dy * dy <= eps_sq {
                    sets.union(i as u32, j);
                }
            }
        }
        debug_assert!(grid.is_empty());

        let mut next = Vec::new();
        next.try_reserve(input.len())?;
        for group in sets.groups() {
            let mut members: SmallVec<[u32; 4]> =
                group.iter().map(|&i| input[i as usize]).collect();
            members.sort_unstable_by_key(|&s| entries[s as usize].id());
            let weight = leaf_weight(members.iter().map(|&s| &entries[s as usize]));

            // A lone cluster is carried up as is rather than wrapped again
            let promote = weight >= self.min_weight
                && match members.as_slice() {
                    [only] => !entries[*only as usize].is_cluster(),
                    _ => true,
                };
            if !promote {
                next.extend_from_slice(&members);
                continue;
            }

            let slot = self.form_cluster(zoom, &members, entries, prior, formations.as_deref_mut());
            next.push(slot);
        }
        Ok(next)
    }

    /// Merge `members`, sorted by entry id, into a cluster at `zoom`, reusing a prior
    /// one when possible
    fn form_cluster<T>(
        &self,
        zoom: u8,
        members: &[u32],
        entries: &mut Vec<Entry<T>>,
        prior: Option<&ClusterTree<T>>,
        formations: Option<&mut HashMap<(u8, EntryId), u32>>,
    ) -> u32 {
        let child_ids: SmallVec<[EntryId; 4]> =
            members.iter().map(|&s| entries[s as usize].id()).collect();
        let first_child = child_ids[0];

        let reused = prior
            .and_then(|tree| tree.formation(zoom, first_child))
            .filter(|cluster| {
                cluster
                    .children()
                    .iter()
                    .map(Entry::id)
                    .eq(child_ids.iter().copied())
            })
            .cloned();

        let cluster = match reused {
            Some(cluster) => cluster,
            None => {
                let children: SmallVec<[Entry<T>; 4]> =
                    members.iter().map(|&s| entries[s as usize].clone()).collect();
                let id = ClusterId(self.cluster_ids.fetch_add(1, Ordering::Relaxed));
                Arc::new(Cluster::from_children(id, zoom, children, |world| {
                    self.projection.point_to_geo(world)
                }))
            }
        };

        for &s in members {
            entries[s as usize].set_min_zoom(zoom + 1);
        }

        let slot = entries.len() as u32;
        entries.push(Entry::cluster(cluster, self.min_zoom));
        if let Some(formations) = formations {
            formations.insert((zoom, first_child), slot);
        }
        slot
    }
}
