//! Point store holding the current data set
//!
//! Points are validated and projected once, on insertion, and kept as shared
//! [`NoisePoint`] records ordered by id, so every build sees them in a stable order.

use crate::{DataPoint, NoisePoint, PointError, PointId, Projection, utils};
use geo::Rect;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Batches at least this large are validated and projected in parallel
const PARALLEL_BATCH_THRESHOLD: usize = 1024;

/// A point of a batch that was not accepted
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PointRejection {
    /// Position of the point in the submitted batch
    pub index: usize,
    #[cfg_attr(feature = "serde", serde(serialize_with = "serialize_reason"))]
    pub error: PointError,
}

#[cfg(feature = "serde")]
fn serialize_reason<S: serde::Serializer>(error: &PointError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

/// Outcome of a batch mutation
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct MutationReport {
    /// Ids of the accepted points, in batch order
    pub accepted: Vec<PointId>,
    /// Rejected points with their batch index and reason
    pub rejected: Vec<PointRejection>,
}

impl MutationReport {
    /// Whether every submitted point was accepted
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Cached statistics for the store
///
/// These are updated incrementally when points are added. Removals only mark the
/// bounding box stale; it is recomputed on the next read.
#[derive(Debug, Clone, Default)]
struct CachedStats {
    /// Sum of all point weights
    total_weight: f64,
    /// Cached geographic bounding box (None if empty)
    bounding_box: Option<Rect<f64>>,
    /// Set when a removal may have shrunk the bounding box
    bounding_box_stale: bool,
}

/// The current set of points
#[derive(Debug)]
pub(crate) struct PointStore<T> {
    points: BTreeMap<PointId, Arc<NoisePoint<T>>>,
    next_id: u64,
    cached_stats: CachedStats,
}

impl<T> Default for PointStore<T> {
    fn default() -> Self {
        Self {
            points: BTreeMap::new(),
            next_id: 0,
            cached_stats: CachedStats::default(),
        }
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<T: Send + Sync> PointStore<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Validate and store a single point
    pub(crate) fn add(
        &mut self,
        projection: &dyn Projection,
        point: DataPoint<T>,
    ) -> Result<Arc<NoisePoint<T>>, PointError> {
        point.validate()?;
        let world = projection.lat_lng_to_point(point.lat(), point.lng());
        Ok(self.store(point, world))
    }

    /// Validate and store a batch; rejected points are reported, the rest are kept
    pub(crate) fn add_many(
        &mut self,
        projection: &dyn Projection,
        points: Vec<DataPoint<T>>,
    ) -> (Vec<Arc<NoisePoint<T>>>, MutationReport) {
        #[cfg(feature = "profiling")]
        profiling::scope!("store::add_many");

        let prepare = |(index, point): (usize, DataPoint<T>)| match point.validate() {
            Ok(()) => {
                let world = projection.lat_lng_to_point(point.lat(), point.lng());
                Ok((point, world))
            }
            Err(error) => Err(PointRejection { index, error }),
        };

        // Validation and projection dominate; ids are assigned sequentially afterwards
        let prepared: Vec<_> = if points.len() >= PARALLEL_BATCH_THRESHOLD {
            points.into_par_iter().enumerate().map(prepare).collect()
        } else {
            points.into_iter().enumerate().map(prepare).collect()
        };

        let mut report = MutationReport::default();
        let mut stored = Vec::with_capacity(prepared.len());
        for result in prepared {
            match result {
                Ok((point, world)) => {
                    let record = self.store(point, world);
                    report.accepted.push(record.id());
                    stored.push(record);
                }
                Err(rejection) => {
                    tracing::warn!(
                        "Rejected point {} of batch: {}",
                        rejection.index,
                        rejection.error
                    );
                    report.rejected.push(rejection);
                }
            }
        }

        (stored, report)
    }

    /// Drop every point and store `points` instead
    pub(crate) fn replace_all(
        &mut self,
        projection: &dyn Projection,
        points: Vec<DataPoint<T>>,
    ) -> (Vec<Arc<NoisePoint<T>>>, MutationReport) {
        self.clear();
        self.add_many(projection, points)
    }

    pub(crate) fn remove(&mut self, id: PointId) -> Option<Arc<NoisePoint<T>>> {
        let removed = self.points.remove(&id)?;
        self.cached_stats.total_weight -= removed.weight();
        self.cached_stats.bounding_box_stale = true;
        if self.points.is_empty() {
            self.cached_stats = CachedStats::default();
        }
        Some(removed)
    }

    pub(crate) fn clear(&mut self) {
        self.points.clear();
        self.cached_stats = CachedStats::default();
    }

    pub(crate) fn get(&self, id: PointId) -> Option<&Arc<NoisePoint<T>>> {
        self.points.get(&id)
    }

    /// Points in id order, optionally restricted to a geographic region
    pub(crate) fn collect(&self, region: Option<Rect<f64>>) -> Vec<Arc<NoisePoint<T>>> {
        match region {
            Some(region) => self
                .points
                .values()
                .filter(|p| utils::rect_contains_point(region, p.position()))
                .cloned()
                .collect(),
            None => self.points.values().cloned().collect(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Sum of all point weights
    #[inline]
    pub(crate) fn total_weight(&self) -> f64 {
        self.cached_stats.total_weight
    }

    /// Geographic bounding box of all points (`None` when empty)
    pub(crate) fn bounding_box(&mut self) -> Option<Rect<f64>> {
        if self.cached_stats.bounding_box_stale {
            self.rebuild_bounding_box();
        }
        self.cached_stats.bounding_box
    }

    fn store(&mut self, point: DataPoint<T>, world: geo::Coord<f64>) -> Arc<NoisePoint<T>> {
        let id = PointId(self.next_id);
        self.next_id += 1;

        self.update_stats_for_added_point(&point);
        let record = Arc::new(NoisePoint::new(id, point, world));
        self.points.insert(id, record.clone());
        record
    }

    /// Update cached statistics when a point is added
    #[inline]
    fn update_stats_for_added_point(&mut self, point: &DataPoint<T>) {
        self.cached_stats.total_weight += point.weight();

        let point_box = utils::point_rect(point.position());
        self.cached_stats.bounding_box = Some(match self.cached_stats.bounding_box {
            Some(bbox) => utils::rect_union(bbox, point_box),
            None => point_box,
        });
    }

    /// Recompute the bounding box from scratch after removals
    fn rebuild_bounding_box(&mut self) {
        self.cached_stats.bounding_box = self
            .points
            .values()
            .map(|p| utils::point_rect(p.position()))
            .reduce(utils::rect_union);
        self.cached_stats.bounding_box_stale = false;
    }
}
