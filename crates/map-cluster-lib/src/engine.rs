//! ClusterEngine - Point store, rebuild coordination and snapshot publishing
//!
//! Mutations update the point store and advance the requested generation. A single
//! writer at a time turns the store into a new [`ClusterTree`] and swaps it in, while
//! readers keep querying whichever snapshot was current when they started.

use crate::builder::{BuildRequest, ClusterBuilder};
use crate::grid::GridSpec;
use crate::store::PointStore;
use crate::tree::Coverage;
use crate::{
    ClusterError, ClusterTree, DataPoint, Entry, MAX_SUPPORTED_ZOOM, MutationReport, NoisePoint,
    PointId, Projection, Result, Strategy, WebMercator, utils,
};
use dashmap::DashSet;
use geo::{Point, Rect};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    TryLockError,
};
use tokio::sync::watch;

/// Where rebuilds run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Scheduling {
    /// On the mutating thread; build errors are returned to the caller
    #[default]
    Inline,
    /// On the rayon pool through a single writer loop; errors are logged and kept
    /// for [`ClusterEngine::take_last_error`]
    Background,
}

/// What happens to an in-flight build when newer mutations arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum RebuildPolicy {
    /// Abort the stale build at the next level boundary and start over
    #[default]
    Cancel,
    /// Finish the stale build, publish it, then build once more
    Coalesce,
}

/// Configuration for the clustering engine
///
/// Epsilon is measured in pixels of the zoom level being grouped: the unit world plane
/// is scaled by `tile_size * 2^zoom`, so a fixed epsilon covers half the geographic
/// distance at every finer zoom.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Merge distance in pixels (default 64)
    pub eps: f64,
    /// Minimum summed weight for a group to become a cluster (default 2)
    pub min_weight: f64,
    pub strategy: Strategy,
    /// Coarsest zoom level (default 0)
    pub min_zoom: u8,
    /// Finest zoom level (default 22)
    pub max_zoom: u8,
    /// Size in pixels of the world at zoom 0 (default 256)
    pub tile_size: f64,
    /// Fraction of the viewport added on every side of a dynamic-grid region (default 0.25)
    pub viewport_margin: f64,
    pub scheduling: Scheduling,
    pub rebuild_policy: RebuildPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eps: 64.0,
            min_weight: 2.0,
            strategy: Strategy::FastGrid,
            min_zoom: 0,
            max_zoom: 22,
            tile_size: 256.0,
            viewport_margin: 0.25,
            scheduling: Scheduling::Inline,
            rebuild_policy: RebuildPolicy::Cancel,
        }
    }
}

impl Config {
    /// Check every field; nothing is clamped
    pub fn validate(&self) -> Result<()> {
        self.grid_spec().map(|_| ())
    }

    pub(crate) fn grid_spec(&self) -> Result<GridSpec> {
        let spec = GridSpec::new(self.strategy, self.eps)?;

        if !self.min_weight.is_finite() || self.min_weight <= 0.0 {
            return Err(ClusterError::InvalidMinWeight(self.min_weight));
        }
        if self.max_zoom > MAX_SUPPORTED_ZOOM {
            return Err(ClusterError::ZoomTooLarge(self.max_zoom));
        }
        if self.min_zoom > self.max_zoom {
            return Err(ClusterError::InvalidZoomRange {
                min: self.min_zoom,
                max: self.max_zoom,
            });
        }
        if !self.tile_size.is_finite() || self.tile_size <= 0.0 {
            return Err(ClusterError::InvalidConfig(format!(
                "tile size must be positive and finite, got {}",
                self.tile_size
            )));
        }
        if !self.viewport_margin.is_finite() || self.viewport_margin < 0.0 {
            return Err(ClusterError::InvalidConfig(format!(
                "viewport margin must be non-negative and finite, got {}",
                self.viewport_margin
            )));
        }

        Ok(spec)
    }
}

type Observer = Box<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Default)]
struct WorkerState {
    running: bool,
    pending: bool,
}

struct Inner<T> {
    config: Config,
    spec: GridSpec,
    projection: Arc<dyn Projection>,
    store: Mutex<PointStore<T>>,
    /// Latest published snapshot
    current: RwLock<Arc<ClusterTree<T>>>,
    /// Region requested by queries (dynamic-grid only)
    region: RwLock<Option<Rect<f64>>>,
    /// Generation the next build should reach; advanced under the store lock
    requested: AtomicU64,
    /// Held for the duration of a build so only one writer runs
    build_lock: Mutex<()>,
    worker: Mutex<WorkerState>,
    idle: Condvar,
    last_error: Mutex<Option<ClusterError>>,
    invalidation: AtomicU64,
    observers: RwLock<Vec<Observer>>,
    notifier: watch::Sender<u64>,
    hidden: DashSet<PointId>,
    cluster_ids: AtomicU64,
    #[cfg(test)]
    fail_next_build: std::sync::atomic::AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Clustering engine over points carrying payloads of type `T`
///
/// Cloning the engine yields another handle to the same state.
pub struct ClusterEngine<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ClusterEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ClusterEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEngine")
            .field("config", &self.inner.config)
            .field("projection", &self.inner.projection)
            .field("generation", &read(&self.inner.current).generation())
            .field("requested", &self.inner.requested.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<T: Send + Sync + 'static> ClusterEngine<T> {
    /// Create an engine using the Web Mercator projection
    pub fn new(config: Config) -> Result<Self> {
        Self::with_projection(config, Arc::new(WebMercator))
    }

    /// Create an engine with a custom projection
    pub fn with_projection(config: Config, projection: Arc<dyn Projection>) -> Result<Self> {
        let spec = config.grid_spec()?;
        let coverage = match spec.strategy() {
            Strategy::DynamicGrid => Coverage::Nothing,
            Strategy::FastGrid | Strategy::Grid => Coverage::World,
        };
        let empty = ClusterTree::empty(0, config.min_zoom, config.max_zoom, coverage);
        let (notifier, _) = watch::channel(0);

        tracing::debug!(
            "Created {} engine (eps {}, zooms {}..={})",
            spec.strategy(),
            spec.eps(),
            config.min_zoom,
            config.max_zoom
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                spec,
                projection,
                store: Mutex::new(PointStore::new()),
                current: RwLock::new(Arc::new(empty)),
                region: RwLock::new(None),
                requested: AtomicU64::new(0),
                build_lock: Mutex::new(()),
                worker: Mutex::new(WorkerState::default()),
                idle: Condvar::new(),
                last_error: Mutex::new(None),
                invalidation: AtomicU64::new(0),
                observers: RwLock::new(Vec::new()),
                notifier,
                hidden: DashSet::new(),
                cluster_ids: AtomicU64::new(0),
                #[cfg(test)]
                fail_next_build: std::sync::atomic::AtomicBool::new(false),
            }),
        })
    }

    /// Get a reference to the configuration
    #[inline]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Replace every stored point
    ///
    /// Invalid points are reported and skipped. With inline scheduling a failed rebuild
    /// is returned as [`ClusterError::RebuildFailed`], which still carries the report of
    /// the points now stored.
    pub fn set_data_points(&self, points: Vec<DataPoint<T>>) -> Result<MutationReport> {
        #[cfg(feature = "profiling")]
        profiling::scope!("engine::set_data_points");

        let (report, dirty) = {
            let mut store = lock(&self.inner.store);
            let old = store.collect(None);
            let (stored, report) = store.replace_all(&*self.inner.projection, points);
            let touched = old.iter().chain(&stored).map(|p| p.position());
            let dirty = self.inner.touch(touched);
            (report, dirty)
        };
        self.inner.hidden.clear();

        tracing::info!(
            "Replaced data set: {} points accepted, {} rejected",
            report.accepted.len(),
            report.rejected.len()
        );
        self.inner.schedule_after(dirty, report)
    }

    /// Add one point, returning its id
    ///
    /// A failed inline rebuild returns [`ClusterError::RebuildFailed`] with the stored id.
    pub fn add_data_point(&self, point: DataPoint<T>) -> Result<PointId> {
        let (id, dirty) = {
            let mut store = lock(&self.inner.store);
            let record = store.add(&*self.inner.projection, point)?;
            let dirty = self.inner.touch(std::iter::once(record.position()));
            (record.id(), dirty)
        };
        if dirty {
            self.inner
                .schedule()
                .map_err(|source| ClusterError::RebuildFailed {
                    report: MutationReport {
                        accepted: vec![id],
                        rejected: Vec::new(),
                    },
                    source: Box::new(source),
                })?;
        }
        Ok(id)
    }

    /// Add a batch of points; invalid ones are reported and skipped
    pub fn add_data_points(&self, points: Vec<DataPoint<T>>) -> Result<MutationReport> {
        #[cfg(feature = "profiling")]
        profiling::scope!("engine::add_data_points");

        let (report, dirty) = {
            let mut store = lock(&self.inner.store);
            let (stored, report) = store.add_many(&*self.inner.projection, points);
            let dirty = self.inner.touch(stored.iter().map(|p| p.position()));
            (report, dirty)
        };
        self.inner.schedule_after(dirty, report)
    }

    /// Remove a point; returns whether it was stored
    ///
    /// The point is gone from the store even when the rebuild that follows fails.
    pub fn remove_data_point(&self, id: PointId) -> Result<bool> {
        let dirty = {
            let mut store = lock(&self.inner.store);
            let Some(removed) = store.remove(id) else {
                return Ok(false);
            };
            self.inner.touch(std::iter::once(removed.position()))
        };
        self.inner.hidden.remove(&id);
        if dirty {
            self.inner.schedule()?;
        }
        Ok(true)
    }

    /// Entries visible at `zoom` whose bounds intersect `bounds`
    ///
    /// * `visible_only` drops entries whose points are all hidden
    /// * `cache_only` answers from the current snapshot without triggering any build;
    ///   otherwise a dynamic-grid engine first extends its region to cover `bounds`
    ///
    /// Zooms outside the configured range are clamped into it. With inline scheduling the
    /// build of a newly covered dynamic-grid region runs on the calling thread.
    pub fn request_entries(
        &self,
        bounds: Rect<f64>,
        zoom: u8,
        visible_only: bool,
        cache_only: bool,
    ) -> Result<Vec<Entry<T>>> {
        #[cfg(feature = "profiling")]
        profiling::scope!("engine::request_entries");

        if !cache_only {
            self.inner.refresh_for(bounds)?;
        }

        let tree = self.snapshot();
        let hidden = &self.inner.hidden;
        if visible_only && !hidden.is_empty() {
            Ok(tree.query_filtered(bounds, zoom, |entry| {
                entry.any_point(|p| !hidden.contains(&p.id()))
            }))
        } else {
            Ok(tree.query(bounds, zoom))
        }
    }

    /// Latest published snapshot
    #[inline]
    pub fn snapshot(&self) -> Arc<ClusterTree<T>> {
        read(&self.inner.current).clone()
    }

    /// Counter advanced on every publish and visibility change
    #[inline]
    pub fn invalidation_mark(&self) -> u64 {
        self.inner.invalidation.load(Ordering::Acquire)
    }

    /// Register a callback run with the new invalidation mark after every change
    ///
    /// Callbacks run on the thread that published; they must not register observers.
    pub fn on_update(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        write(&self.inner.observers).push(Box::new(callback));
    }

    /// Receiver of invalidation marks for async consumers
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.notifier.subscribe()
    }

    /// Show or hide a stored point; returns whether its visibility changed
    pub fn set_point_visible(&self, id: PointId, visible: bool) -> bool {
        let changed = if visible {
            self.inner.hidden.remove(&id).is_some()
        } else {
            lock(&self.inner.store).get(id).is_some() && self.inner.hidden.insert(id)
        };
        if changed {
            self.inner.notify();
        }
        changed
    }

    #[inline]
    pub fn is_point_visible(&self, id: PointId) -> bool {
        !self.inner.hidden.contains(&id)
    }

    /// Rebuild from the current store even if nothing changed
    pub fn rebuild(&self) -> Result<()> {
        {
            let _store = lock(&self.inner.store);
            self.inner.mark_dirty();
        }
        self.inner.schedule()
    }

    /// Block until no background build is running or pending
    pub fn wait_idle(&self) {
        let mut worker = lock(&self.inner.worker);
        while worker.running {
            worker = self
                .inner
                .idle
                .wait(worker)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Error of the last failed background build, if any
    pub fn take_last_error(&self) -> Option<ClusterError> {
        lock(&self.inner.last_error).take()
    }

    /// Number of stored points
    pub fn len(&self) -> usize {
        lock(&self.inner.store).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.store).is_empty()
    }

    /// Sum of the stored point weights
    pub fn total_weight(&self) -> f64 {
        lock(&self.inner.store).total_weight()
    }

    pub fn point(&self, id: PointId) -> Option<Arc<NoisePoint<T>>> {
        lock(&self.inner.store).get(id).cloned()
    }

    /// Geographic bounding box of every stored point (`None` if empty)
    pub fn bounding_box(&self) -> Option<Rect<f64>> {
        lock(&self.inner.store).bounding_box()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<T: Send + Sync + 'static> Inner<T> {
    fn coverage(&self) -> Coverage {
        match self.spec.strategy() {
            Strategy::FastGrid | Strategy::Grid => Coverage::World,
            Strategy::DynamicGrid => match *read(&self.region) {
                Some(region) => Coverage::Region(region),
                None => Coverage::Nothing,
            },
        }
    }

    /// Advance the requested generation; callers hold the store lock
    fn mark_dirty(&self) -> u64 {
        self.requested.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Mark the store dirty if any of `positions` is covered by the built area
    fn touch(&self, mut positions: impl Iterator<Item = Point<f64>>) -> bool {
        let affected = match self.coverage() {
            Coverage::World => positions.next().is_some(),
            Coverage::Region(region) => positions.any(|p| utils::rect_contains_point(region, p)),
            Coverage::Nothing => false,
        };
        if affected {
            self.mark_dirty();
        } else {
            tracing::trace!("Mutation outside the built region, no rebuild needed");
        }
        affected
    }

    fn is_dirty(&self) -> bool {
        self.requested.load(Ordering::Acquire) > read(&self.current).generation()
    }

    /// Bring the snapshot up to date for a query over `bounds` without waiting on a build
    fn refresh_for(self: &Arc<Self>, bounds: Rect<f64>) -> Result<()> {
        let moved = self.spec.strategy() == Strategy::DynamicGrid && self.extend_region(bounds);
        if !moved && !self.is_dirty() {
            return Ok(());
        }

        match self.config.scheduling {
            Scheduling::Inline => match self.rebuild_once(false) {
                Ok(_) | Err(ClusterError::Cancelled(_)) => Ok(()),
                Err(err) => Err(err),
            },
            Scheduling::Background => {
                self.spawn_worker();
                Ok(())
            }
        }
    }

    /// Request a region covering `bounds` plus the margin; returns whether it changed
    fn extend_region(&self, bounds: Rect<f64>) -> bool {
        let Some(view) = utils::clip_to_world(bounds) else {
            return false;
        };

        let _store = lock(&self.store);
        let mut region = write(&self.region);
        if region.is_some_and(|r| utils::rect_contains(r, view)) {
            return false;
        }

        let expanded = utils::expand_rect(view, self.config.viewport_margin);
        tracing::debug!("Moving built region to {:?}", expanded);
        *region = Some(expanded);
        self.mark_dirty();
        true
    }

    /// Rebuild according to the scheduling mode
    fn schedule(self: &Arc<Self>) -> Result<()> {
        match self.config.scheduling {
            Scheduling::Inline => loop {
                match self.rebuild_once(true) {
                    Ok(_) => return Ok(()),
                    // A newer request cancelled us; build again to cover it
                    Err(ClusterError::Cancelled(generation)) => {
                        tracing::debug!("Restarting after cancelled generation {}", generation);
                    }
                    Err(err) => {
                        tracing::warn!("Rebuild failed: {}", err);
                        return Err(err);
                    }
                }
            },
            Scheduling::Background => {
                self.spawn_worker();
                Ok(())
            }
        }
    }

    /// Rebuild after a store mutation, keeping `report` when the rebuild fails
    fn schedule_after(
        self: &Arc<Self>,
        dirty: bool,
        report: MutationReport,
    ) -> Result<MutationReport> {
        if !dirty {
            return Ok(report);
        }
        match self.schedule() {
            Ok(()) => Ok(report),
            Err(source) => Err(ClusterError::RebuildFailed {
                report,
                source: Box::new(source),
            }),
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let mut worker = lock(&self.worker);
        if worker.running {
            worker.pending = true;
            return;
        }
        worker.running = true;
        worker.pending = false;
        drop(worker);

        let inner = Arc::clone(self);
        rayon::spawn(move || inner.worker_loop());
    }

    fn worker_loop(&self) {
        loop {
            match self.rebuild_once(true) {
                Ok(_) => {}
                Err(ClusterError::Cancelled(generation)) => {
                    tracing::debug!("Background build of generation {} cancelled", generation);
                }
                Err(err) => {
                    tracing::error!("Background rebuild failed: {}", err);
                    *lock(&self.last_error) = Some(err);
                }
            }

            let mut worker = lock(&self.worker);
            if worker.pending {
                worker.pending = false;
                continue;
            }
            worker.running = false;
            self.idle.notify_all();
            return;
        }
    }

    /// Build and publish one snapshot of the latest requested generation
    ///
    /// Returns whether a snapshot was published. With `wait == false` the call gives up
    /// when another build is running.
    fn rebuild_once(&self, wait: bool) -> Result<bool> {
        let guard = match self.build_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) if wait => lock(&self.build_lock),
            Err(TryLockError::WouldBlock) => return Ok(false),
        };

        let prior = read(&self.current).clone();
        let (generation, points, coverage) = {
            let store = lock(&self.store);
            let generation = self.requested.load(Ordering::Acquire);
            if generation <= prior.generation() {
                return Ok(false);
            }
            let coverage = self.coverage();
            let points = match coverage {
                Coverage::World => store.collect(None),
                Coverage::Region(region) => store.collect(Some(region)),
                Coverage::Nothing => Vec::new(),
            };
            (generation, points, coverage)
        };

        #[cfg(test)]
        if self.fail_next_build.swap(false, Ordering::AcqRel) {
            if let Err(err) = Vec::<u8>::new().try_reserve(usize::MAX) {
                return Err(err.into());
            }
        }

        tracing::debug!(
            "Building generation {} from {} points",
            generation,
            points.len()
        );

        let builder = ClusterBuilder {
            spec: self.spec,
            projection: &*self.projection,
            min_zoom: self.config.min_zoom,
            max_zoom: self.config.max_zoom,
            tile_size: self.config.tile_size,
            min_weight: self.config.min_weight,
            cluster_ids: &self.cluster_ids,
        };
        let reuse = self.spec.strategy() == Strategy::DynamicGrid;
        let cancelled = || {
            self.config.rebuild_policy == RebuildPolicy::Cancel
                && self.requested.load(Ordering::Acquire) > generation
        };
        let tree = builder.build(
            BuildRequest {
                generation,
                points,
                coverage,
                prior: reuse.then_some(&*prior),
            },
            &cancelled,
        )?;

        let info = tree.info();
        let published = {
            let mut current = write(&self.current);
            if tree.generation() > current.generation() {
                *current = Arc::new(tree);
                true
            } else {
                false
            }
        };
        drop(guard);

        if published {
            tracing::info!(
                "Published generation {} ({} points, {} clusters)",
                info.generation,
                info.point_count,
                info.cluster_count
            );
            self.notify();
        }
        Ok(published)
    }

    /// Advance the invalidation mark and tell every observer
    fn notify(&self) {
        let mark = self.invalidation.fetch_add(1, Ordering::AcqRel) + 1;
        for observer in read(&self.observers).iter() {
            observer(mark);
        }
        self.notifier.send_replace(mark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntryId, Equirectangular};
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    fn world() -> Rect<f64> {
        utils::world_bounds()
    }

    fn fixture_points() -> Vec<DataPoint<&'static str>> {
        vec![
            DataPoint::new(0.0, 0.0, "a"),
            DataPoint::new(0.0, 0.0001, "b"),
            DataPoint::new(10.0, 10.0, "c"),
        ]
    }

    /// Leaf ids of every entry per zoom, for membership comparisons
    fn membership<T: Send + Sync + 'static>(
        engine: &ClusterEngine<T>,
    ) -> Vec<BTreeSet<Vec<PointId>>> {
        let config = engine.config();
        (config.min_zoom..=config.max_zoom)
            .map(|zoom| {
                engine
                    .request_entries(world(), zoom, false, true)
                    .unwrap()
                    .iter()
                    .map(|entry| {
                        let mut ids = Vec::new();
                        entry.for_each_data_point(|p| ids.push(p.id()));
                        ids.sort();
                        ids
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());

        let fast = |eps| Config {
            eps,
            ..Config::default()
        };
        assert!(matches!(
            ClusterEngine::<()>::new(fast(17.0)),
            Err(ClusterError::InvalidEpsilon { .. })
        ));
        assert!(ClusterEngine::<()>::new(fast(32.0)).is_ok());

        let grid = Config {
            strategy: Strategy::Grid,
            eps: 200.0,
            ..Config::default()
        };
        assert!(matches!(
            grid.validate(),
            Err(ClusterError::InvalidEpsilon { .. })
        ));

        let cases = [
            Config {
                min_weight: 0.0,
                ..Config::default()
            },
            Config {
                min_weight: f64::NAN,
                ..Config::default()
            },
            Config {
                min_zoom: 5,
                max_zoom: 4,
                ..Config::default()
            },
            Config {
                max_zoom: 31,
                ..Config::default()
            },
            Config {
                tile_size: 0.0,
                ..Config::default()
            },
            Config {
                viewport_margin: -0.1,
                ..Config::default()
            },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
        assert!(matches!(
            Config {
                max_zoom: 31,
                ..Config::default()
            }
            .validate(),
            Err(ClusterError::ZoomTooLarge(31))
        ));
    }

    #[test]
    fn test_regression_fixture() {
        let engine = ClusterEngine::new(Config::default()).unwrap();
        let report = engine.set_data_points(fixture_points()).unwrap();
        assert!(report.is_clean());

        let at_10 = engine.request_entries(world(), 10, false, false).unwrap();
        assert_eq!(at_10.len(), 2);
        let cluster = at_10.iter().find(|e| e.is_cluster()).unwrap();
        assert_eq!(cluster.weight(), 2.0);
        assert_eq!(at_10.iter().filter(|e| !e.is_cluster()).count(), 1);

        let at_0 = engine.request_entries(world(), 0, false, false).unwrap();
        assert_eq!(at_0.len(), 1);
        assert_eq!(at_0[0].weight(), 3.0);

        let at_20 = engine.request_entries(world(), 20, false, false).unwrap();
        assert_eq!(at_20.len(), 3);
        assert!(at_20.iter().all(|e| !e.is_cluster()));
    }

    #[test]
    fn test_zoom_is_clamped() {
        let config = Config {
            min_zoom: 3,
            max_zoom: 12,
            ..Config::default()
        };
        let engine = ClusterEngine::new(config).unwrap();
        engine.set_data_points(fixture_points()).unwrap();
        assert_eq!(
            engine.request_entries(world(), 0, false, true).unwrap().len(),
            engine.request_entries(world(), 3, false, true).unwrap().len()
        );
        assert_eq!(
            engine.request_entries(world(), 30, false, true).unwrap().len(),
            engine.request_entries(world(), 12, false, true).unwrap().len()
        );
    }

    #[test]
    fn test_invalid_points() {
        let engine = ClusterEngine::new(Config::default()).unwrap();
        let err = engine
            .add_data_point(DataPoint::new(f64::NAN, 0.0, ()))
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidPoint(_)));
        assert!(engine.is_empty());

        let report = engine
            .add_data_points(vec![
                DataPoint::new(0.0, 0.0, ()),
                DataPoint::new(0.0, 200.0, ()),
                DataPoint::new(1.0, 1.0, ()).with_weight(0.0),
                DataPoint::new(2.0, 2.0, ()),
            ])
            .unwrap();
        assert_eq!(report.accepted.len(), 2);
        let indices: Vec<usize> = report.rejected.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.snapshot().point_count(), 2);
    }

    #[test]
    fn test_insert_remove_inverse() {
        let engine = ClusterEngine::new(Config::default()).unwrap();
        engine.set_data_points(fixture_points()).unwrap();
        let before = membership(&engine);

        let id = engine.add_data_point(DataPoint::new(0.0, 0.00005, "d")).unwrap();
        assert_ne!(membership(&engine), before);
        assert!(engine.remove_data_point(id).unwrap());
        assert!(!engine.remove_data_point(id).unwrap());
        assert_eq!(membership(&engine), before);
    }

    #[test]
    fn test_remove_all_yields_empty_snapshot() {
        let engine = ClusterEngine::new(Config::default()).unwrap();
        let report = engine.set_data_points(fixture_points()).unwrap();
        for id in report.accepted {
            engine.remove_data_point(id).unwrap();
        }
        let snapshot = engine.snapshot();
        assert!(snapshot.is_empty());
        for zoom in [0, 10, 22] {
            assert!(engine.request_entries(world(), zoom, false, false).unwrap().is_empty());
        }
        assert!(engine.bounding_box().is_none());
    }

    #[test]
    fn test_snapshots_are_isolated() {
        let engine = ClusterEngine::new(Config::default()).unwrap();
        engine.set_data_points(fixture_points()).unwrap();
        let old = engine.snapshot();

        engine.add_data_point(DataPoint::new(-33.9, 151.2, "sydney")).unwrap();
        let new = engine.snapshot();
        assert!(new.generation() > old.generation());
        assert_eq!(old.point_count(), 3);
        assert_eq!(new.point_count(), 4);
        assert_eq!(old.query(world(), 22).len(), 3);
    }

    #[test]
    fn test_notifications() {
        let engine = ClusterEngine::new(Config::default()).unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let observer = Arc::clone(&seen);
        engine.on_update(move |mark| observer.store(mark, Ordering::SeqCst));
        let receiver = engine.subscribe();

        assert_eq!(engine.invalidation_mark(), 0);
        engine.set_data_points(fixture_points()).unwrap();
        assert_eq!(engine.invalidation_mark(), 1);
        engine.add_data_point(DataPoint::new(5.0, 5.0, "e")).unwrap();
        assert_eq!(engine.invalidation_mark(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(*receiver.borrow(), 2);

        engine.rebuild().unwrap();
        assert_eq!(engine.invalidation_mark(), 3);
    }

    #[test]
    fn test_visibility() {
        let engine = ClusterEngine::new(Config::default()).unwrap();
        let report = engine.set_data_points(fixture_points()).unwrap();
        let (a, b) = (report.accepted[0], report.accepted[1]);
        let mark = engine.invalidation_mark();

        assert!(engine.set_point_visible(a, false));
        assert!(!engine.set_point_visible(a, false));
        assert!(!engine.is_point_visible(a));
        assert_eq!(engine.invalidation_mark(), mark + 1);

        // One visible leaf keeps the pair cluster visible
        let at_10 = engine.request_entries(world(), 10, true, true).unwrap();
        assert_eq!(at_10.len(), 2);

        engine.set_point_visible(b, false);
        let at_10 = engine.request_entries(world(), 10, true, true).unwrap();
        assert_eq!(at_10.len(), 1);
        assert!(!at_10[0].is_cluster());
        let at_20 = engine.request_entries(world(), 20, true, true).unwrap();
        assert_eq!(at_20.len(), 1);

        // Hidden entries are still returned when not filtering
        assert_eq!(engine.request_entries(world(), 10, false, true).unwrap().len(), 2);

        assert!(engine.set_point_visible(a, true));
        assert_eq!(engine.request_entries(world(), 10, true, true).unwrap().len(), 2);

        // Unknown points cannot be hidden
        assert!(!engine.set_point_visible(PointId(999), false));
    }

    #[test]
    fn test_background_scheduling() {
        for policy in [RebuildPolicy::Cancel, RebuildPolicy::Coalesce] {
            let config = Config {
                scheduling: Scheduling::Background,
                rebuild_policy: policy,
                ..Config::default()
            };
            let engine = ClusterEngine::new(config).unwrap();
            let publishes = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&publishes);
            engine.on_update(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            for i in 0..20 {
                let points = (0..50)
                    .map(|j| DataPoint::new(i as f64, j as f64 * 0.01, (i, j)))
                    .collect();
                engine.add_data_points(points).unwrap();
            }
            engine.wait_idle();

            let snapshot = engine.snapshot();
            assert_eq!(snapshot.point_count(), 1000);
            assert!(publishes.load(Ordering::SeqCst) >= 1);
            assert!(engine.take_last_error().is_none());

            let mut total = 0.0;
            snapshot.for_each_entry(0, |entry| total += entry.weight());
            assert_eq!(total, 1000.0);
        }
    }

    #[test]
    fn test_concurrent_readers() {
        let engine = ClusterEngine::new(Config::default()).unwrap();
        engine.set_data_points(fixture_points()).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let engine = engine.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        let entries = engine.request_entries(world(), 0, false, true).unwrap();
                        let total: f64 = entries.iter().map(Entry::weight).sum();
                        // Every snapshot is complete: weight is a whole number of points
                        assert_eq!(total.fract(), 0.0);
                        assert!(total >= 3.0);
                    }
                });
            }
            for i in 0..20 {
                engine
                    .add_data_point(DataPoint::new(-10.0, i as f64, "w"))
                    .unwrap();
            }
        });
        assert_eq!(engine.snapshot().point_count(), 23);
    }

    #[test]
    fn test_dynamic_grid_region() {
        let config = Config {
            strategy: Strategy::DynamicGrid,
            ..Config::default()
        };
        let engine = ClusterEngine::new(config).unwrap();
        engine.set_data_points(fixture_points()).unwrap();

        // Nothing is built before a viewport is requested
        assert_eq!(engine.snapshot().generation(), 0);
        let view = utils::lat_lng_rect(-20.0, -20.0, 20.0, 20.0);
        assert!(engine.request_entries(view, 10, false, true).unwrap().is_empty());
        assert!(engine.snapshot().region().is_none());

        let at_10 = engine.request_entries(view, 10, false, false).unwrap();
        assert_eq!(at_10.len(), 2);
        let snapshot = engine.snapshot();
        let region = snapshot.region().unwrap();
        assert!(utils::rect_contains(region, view));
        assert!(snapshot.covers(view));
        let pair = at_10.iter().find(|e| e.is_cluster()).unwrap().clone();

        // Mutations outside the region leave the snapshot alone
        let generation = snapshot.generation();
        engine.add_data_point(DataPoint::new(60.0, 100.0, "far")).unwrap();
        assert_eq!(engine.snapshot().generation(), generation);
        assert!(Arc::ptr_eq(&engine.snapshot(), &snapshot));

        // Mutations inside rebuild and reuse the unchanged pair
        engine.add_data_point(DataPoint::new(1.0, 1.0, "near")).unwrap();
        let rebuilt = engine.snapshot();
        assert!(rebuilt.generation() > generation);
        let again = engine.request_entries(view, 10, false, true).unwrap();
        let pair_again = again
            .iter()
            .find(|e| e.id() == pair.id())
            .expect("pair cluster reused");
        assert!(Arc::ptr_eq(
            pair.as_cluster().unwrap(),
            pair_again.as_cluster().unwrap()
        ));

        // Moving the viewport away builds the new area
        let far_view = utils::lat_lng_rect(50.0, 90.0, 70.0, 110.0);
        let far = engine.request_entries(far_view, 10, false, false).unwrap();
        assert_eq!(far.len(), 1);
        assert_eq!(far[0].id(), EntryId::Point(PointId(3)));
        assert!(engine.snapshot().find(pair.id(), 10).is_none());
    }

    #[test]
    fn test_custom_projection() {
        let engine =
            ClusterEngine::with_projection(Config::default(), Arc::new(Equirectangular)).unwrap();
        engine.set_data_points(fixture_points()).unwrap();
        let at_0 = engine.request_entries(world(), 0, false, false).unwrap();
        assert_eq!(at_0.len(), 1);
        let centroid = at_0[0].position();
        assert!((centroid.x() - 10.0 / 3.0).abs() < 1e-3);
        assert!((centroid.y() - 10.0 / 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_failed_rebuild_keeps_mutation() {
        let engine = ClusterEngine::new(Config::default()).unwrap();
        engine.set_data_points(fixture_points()).unwrap();
        let published = engine.snapshot();

        engine.inner.fail_next_build.store(true, Ordering::SeqCst);
        let err = engine
            .add_data_point(DataPoint::new(5.0, 5.0, "d"))
            .unwrap_err();
        let ClusterError::RebuildFailed { report, source } = err else {
            panic!("expected a rebuild failure");
        };
        assert!(matches!(*source, ClusterError::OutOfMemory(_)));
        assert_eq!(report.accepted.len(), 1);
        let id = report.accepted[0];
        assert_eq!(engine.point(id).unwrap().payload(), &"d");
        assert!(Arc::ptr_eq(&engine.snapshot(), &published));

        engine.inner.fail_next_build.store(true, Ordering::SeqCst);
        let err = engine
            .add_data_points(vec![
                DataPoint::new(6.0, 6.0, "e"),
                DataPoint::new(f64::NAN, 0.0, "bad"),
            ])
            .unwrap_err();
        let ClusterError::RebuildFailed { report, .. } = err else {
            panic!("expected a rebuild failure");
        };
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(engine.snapshot().generation(), published.generation());

        // The returned id stays usable and the next rebuild catches up
        assert!(engine.remove_data_point(id).unwrap());
        assert!(engine.point(id).is_none());
        assert_eq!(engine.snapshot().point_count(), 4);
    }
}
