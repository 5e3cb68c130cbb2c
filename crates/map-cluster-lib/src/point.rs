//! Weighted geographic data points
//!
//! Points are immutable once handed to the engine. Updating a point means removing it
//! and adding a replacement, which receives a fresh [`PointId`].

use geo::Point;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned to a point when the store accepts it
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PointId(pub(crate) u64);

impl PointId {
    /// Raw numeric value of the id
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Reasons a point is rejected at insertion time
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PointError {
    #[error("non-finite coordinate (lat {lat}, lng {lng})")]
    NonFiniteCoordinate { lat: f64, lng: f64 },

    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),

    #[error("weight must be positive and finite, got {0}")]
    InvalidWeight(f64),
}

/// A weighted geographic point carrying an opaque payload
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DataPoint<T> {
    /// Position with `x = lng` and `y = lat`, in degrees
    position: Point<f64>,
    weight: f64,
    payload: T,
}

impl<T> DataPoint<T> {
    /// Create a point with the default weight of 1
    pub fn new(lat: f64, lng: f64, payload: T) -> Self {
        Self {
            position: Point::new(lng, lat),
            weight: 1.0,
            payload,
        }
    }

    /// Replace the weight (validated when the point is inserted)
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    #[inline]
    pub fn lat(&self) -> f64 {
        self.position.y()
    }

    #[inline]
    pub fn lng(&self) -> f64 {
        self.position.x()
    }

    /// Position with `x = lng` and `y = lat`
    #[inline]
    pub fn position(&self) -> Point<f64> {
        self.position
    }

    #[inline]
    pub fn weight(&self) -> f64 {
        self.weight
    }

    #[inline]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume the point and return its payload
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Check coordinates and weight
    pub fn validate(&self) -> Result<(), PointError> {
        let (lat, lng) = (self.lat(), self.lng());
        if !lat.is_finite() || !lng.is_finite() {
            return Err(PointError::NonFiniteCoordinate { lat, lng });
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(PointError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(PointError::LongitudeOutOfRange(lng));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(PointError::InvalidWeight(self.weight));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weight() {
        let point = DataPoint::new(51.5, -0.12, "london");
        assert_eq!(point.weight(), 1.0);
        assert_eq!(point.lat(), 51.5);
        assert_eq!(point.lng(), -0.12);
        assert_eq!(*point.payload(), "london");
        assert!(point.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_coordinates() {
        assert_eq!(
            DataPoint::new(91.0, 0.0, ()).validate(),
            Err(PointError::LatitudeOutOfRange(91.0))
        );
        assert_eq!(
            DataPoint::new(0.0, -180.5, ()).validate(),
            Err(PointError::LongitudeOutOfRange(-180.5))
        );
        assert!(matches!(
            DataPoint::new(f64::NAN, 0.0, ()).validate(),
            Err(PointError::NonFiniteCoordinate { .. })
        ));
        assert!(matches!(
            DataPoint::new(0.0, f64::INFINITY, ()).validate(),
            Err(PointError::NonFiniteCoordinate { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_weights() {
        for weight in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let point = DataPoint::new(0.0, 0.0, ()).with_weight(weight);
            assert!(
                matches!(point.validate(), Err(PointError::InvalidWeight(_))),
                "weight {weight} should be rejected"
            );
        }
        assert!(DataPoint::new(0.0, 0.0, ()).with_weight(0.25).validate().is_ok());
    }

    #[test]
    fn test_point_id_display() {
        assert_eq!(PointId(42).to_string(), "p42");
        assert_eq!(PointId(42).get(), 42);
    }
}
