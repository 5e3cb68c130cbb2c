//! Projection services placing geographic positions on the clustering plane
//!
//! A projection maps (lat, lng) onto a unit world plane where both axes span `[0, 1]`,
//! `x` growing eastwards and `y` growing southwards like map tiles. The builder scales
//! that plane by `tile_size * 2^zoom` to obtain pixel coordinates for a zoom level.

use crate::utils;
use geo::{Coord, Point};
use std::fmt::Debug;

/// Maps geographic coordinates to the unit world plane and back
pub trait Projection: Send + Sync + Debug {
    /// Project a geographic position onto the unit world plane
    fn lat_lng_to_point(&self, lat: f64, lng: f64) -> Coord<f64>;

    /// Inverse of [`Projection::lat_lng_to_point`]; returns `x = lng`, `y = lat`
    fn point_to_geo(&self, point: Coord<f64>) -> Point<f64>;
}

/// Spherical Web Mercator (EPSG:3857), the projection used by slippy-map tiles
///
/// Latitudes beyond ±85.05° are clamped onto the top/bottom edge of the plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebMercator;

impl Projection for WebMercator {
    #[inline]
    fn lat_lng_to_point(&self, lat: f64, lng: f64) -> Coord<f64> {
        let meters = utils::wgs84_to_mercator(lat, lng);
        Coord {
            x: (meters.x() - utils::EARTH_MERCATOR_MIN) / utils::EARTH_SIZE_METERS,
            y: (utils::EARTH_MERCATOR_MAX - meters.y()) / utils::EARTH_SIZE_METERS,
        }
    }

    #[inline]
    fn point_to_geo(&self, point: Coord<f64>) -> Point<f64> {
        let x = point.x * utils::EARTH_SIZE_METERS + utils::EARTH_MERCATOR_MIN;
        let y = utils::EARTH_MERCATOR_MAX - point.y * utils::EARTH_SIZE_METERS;
        let (lat, lng) = utils::mercator_to_wgs84(x, y);
        Point::new(lng, lat)
    }
}

/// Plate carrée: longitude and latitude mapped linearly onto the plane
#[derive(Debug, Clone, Copy, Default)]
pub struct Equirectangular;

impl Projection for Equirectangular {
    #[inline]
    fn lat_lng_to_point(&self, lat: f64, lng: f64) -> Coord<f64> {
        Coord {
            x: (lng + 180.0) / 360.0,
            y: (90.0 - lat) / 180.0,
        }
    }

    #[inline]
    fn point_to_geo(&self, point: Coord<f64>) -> Point<f64> {
        Point::new(point.x * 360.0 - 180.0, 90.0 - point.y * 180.0)
    }
}
