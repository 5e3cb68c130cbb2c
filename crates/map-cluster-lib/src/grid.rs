//! Epsilon-sized grid used to find merge candidates
//!
//! Entries are bucketed by the cell containing their pixel position. Two entries at
//! most `eps` apart always sit in the same or in adjacent cells, so probing the 3×3
//! block around a position yields every possible merge partner.

use crate::{ClusterError, Result};
use geo::Coord;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Largest epsilon accepted by [`Strategy::FastGrid`]
const FAST_GRID_MAX_EPS: f64 = 256.0;

/// Epsilon range accepted by [`Strategy::Grid`] and [`Strategy::DynamicGrid`]
const GRID_MIN_EPS: f64 = 10.0;
const GRID_MAX_EPS: f64 = 127.0;

/// Grouping strategy, deciding cell math and rebuild scope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Strategy {
    /// Power-of-two epsilon up to 256, integer cell keys via bit shifts.
    /// Suited to large data sets where rebuild speed dominates.
    #[default]
    FastGrid,
    /// Any epsilon in [10, 127], cell keys via float division.
    /// Finer control of cluster shape, for data sets up to about a thousand points.
    Grid,
    /// Grid cell math, but builds only cover the current viewport plus a margin.
    /// Suited to frequently mutated data sets.
    DynamicGrid,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FastGrid => "fast-grid",
            Self::Grid => "grid",
            Self::DynamicGrid => "dynamic-grid",
        }
    }

    pub fn all() -> &'static [Self] {
        &[Self::FastGrid, Self::Grid, Self::DynamicGrid]
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| ClusterError::InvalidConfig(format!("unknown strategy '{s}'")))
    }
}

/// Cell key in the pixel plane of one zoom level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct CellKey {
    x: i64,
    y: i64,
}

/// How a pixel coordinate is turned into a cell coordinate
#[derive(Clone, Copy, Debug, PartialEq)]
enum CellSizing {
    /// `floor(px) >> shift`, with `eps == 1 << shift`
    Shift(u32),
    /// `floor(px / eps)`
    Divide(f64),
}

/// Validated epsilon for a strategy
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct GridSpec {
    strategy: Strategy,
    eps: f64,
    sizing: CellSizing,
}

impl GridSpec {
    /// Validate `eps` against the legal range of `strategy`
    pub(crate) fn new(strategy: Strategy, eps: f64) -> Result<Self> {
        let invalid = |reason| ClusterError::InvalidEpsilon {
            strategy,
            eps,
            reason,
        };

        if !eps.is_finite() {
            return Err(invalid("epsilon must be finite"));
        }

        let sizing = match strategy {
            Strategy::FastGrid => {
                if !(1.0..=FAST_GRID_MAX_EPS).contains(&eps) || eps.fract() != 0.0 {
                    return Err(invalid("expected a power of two between 1 and 256"));
                }
                let value = eps as u32;
                if !value.is_power_of_two() {
                    return Err(invalid("expected a power of two between 1 and 256"));
                }
                CellSizing::Shift(value.trailing_zeros())
            }
            Strategy::Grid | Strategy::DynamicGrid => {
                if !(GRID_MIN_EPS..=GRID_MAX_EPS).contains(&eps) {
                    return Err(invalid("expected a value between 10 and 127"));
                }
                CellSizing::Divide(eps)
            }
        };

        Ok(Self {
            strategy,
            eps,
            sizing,
        })
    }

    #[inline]
    pub(crate) fn eps(&self) -> f64 {
        self.eps
    }

    #[inline]
    pub(crate) fn strategy(&self) -> Strategy {
        self.strategy
    }

    #[inline]
    fn key_for(&self, p: Coord<f64>) -> CellKey {
        match self.sizing {
            CellSizing::Shift(shift) => CellKey {
                x: (p.x.floor() as i64) >> shift,
                y: (p.y.floor() as i64) >> shift,
            },
            CellSizing::Divide(eps) => CellKey {
                x: (p.x / eps).floor() as i64,
                y: (p.y / eps).floor() as i64,
            },
        }
    }
}

/// Buckets of entry slots keyed by grid cell
///
/// Slots are indices into the caller's entry list; positions are in pixels.
#[derive(Debug)]
pub(crate) struct GridIndex {
    spec: GridSpec,
    cells: HashMap<CellKey, SmallVec<[u32; 8]>>,
    len: usize,
}

impl GridIndex {
    pub(crate) fn new(spec: GridSpec) -> Self {
        Self {
            spec,
            cells: HashMap::new(),
            len: 0,
        }
    }

    /// Create an index sized for roughly `capacity` entries
    pub(crate) fn with_capacity(spec: GridSpec, capacity: usize) -> Result<Self> {
        let mut index = Self::new(spec);
        index.cells.try_reserve(capacity)?;
        Ok(index)
    }

    pub(crate) fn insert(&mut self, slot: u32, position: Coord<f64>) {
        let key = self.spec.key_for(position);
        self.cells.entry(key).or_default().push(slot);
        self.len += 1;
    }

    /// Remove a slot previously inserted at `position`; returns whether it was present
    pub(crate) fn remove(&mut self, slot: u32, position: Coord<f64>) -> bool {
        let key = self.spec.key_for(position);
        let Some(bucket) = self.cells.get_mut(&key) else {
            return false;
        };
        let Some(at) = bucket.iter().position(|&s| s == slot) else {
            return false;
        };
        bucket.swap_remove(at);
        if bucket.is_empty() {
            self.cells.remove(&key);
        }
        self.len -= 1;
        true
    }

    /// Slots in the 3×3 block of cells around `position`
    pub(crate) fn neighbors_of(&self, position: Coord<f64>) -> impl Iterator<Item = u32> + '_ {
        let center = self.spec.key_for(position);
        (-1..=1)
            .flat_map(move |dy| (-1..=1).map(move |dx| (dx, dy)))
            .filter_map(move |(dx, dy)| {
                self.cells.get(&CellKey {
                    x: center.x + dx,
                    y: center.y + dy,
                })
            })
            .flat_map(|bucket| bucket.iter().copied())
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub(crate) fn cell_count(&self) -> usize {
        self.cells.len()
    }
}
