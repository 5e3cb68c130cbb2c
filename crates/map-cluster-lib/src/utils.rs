//! Utility functions for coordinate conversions and rectangle arithmetic
//!
//! Geographic rectangles use `x` for longitude and `y` for latitude, in degrees.

use geo::{Coord, Point, Rect};

/// Web Mercator bounds in meters (EPSG:3857)
pub const EARTH_MERCATOR_MAX: f64 = 20037508.34;
pub const EARTH_MERCATOR_MIN: f64 = -20037508.34;
pub const EARTH_SIZE_METERS: f64 = EARTH_MERCATOR_MAX - EARTH_MERCATOR_MIN;

/// Maximum latitude that can be represented in Web Mercator
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Precomputed constant: EARTH_MERCATOR_MAX / 180.0
const LON_TO_X_FACTOR: f64 = EARTH_MERCATOR_MAX / 180.0;

/// Precomputed constant: EARTH_MERCATOR_MAX / PI
const Y_FACTOR: f64 = EARTH_MERCATOR_MAX / std::f64::consts::PI;

/// Precomputed constant: 180.0 / EARTH_MERCATOR_MAX
const X_TO_LON_FACTOR: f64 = 180.0 / EARTH_MERCATOR_MAX;

/// Precomputed constant: PI / EARTH_MERCATOR_MAX
const Y_TO_LAT_FACTOR: f64 = std::f64::consts::PI / EARTH_MERCATOR_MAX;

/// Convert WGS84 (lat, lon) to Web Mercator (x, y) in meters
///
/// # Arguments
/// * `lat` - Latitude in degrees (clamped to ±85.05)
/// * `lon` - Longitude in degrees (-180 to 180)
///
/// # Returns
/// A `Point<f64>` with x (easting) and y (northing) in meters
#[inline(always)]
pub fn wgs84_to_mercator(lat: f64, lon: f64) -> Point<f64> {
    // Clamp latitude to valid Web Mercator range
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);

    let x = lon * LON_TO_X_FACTOR;

    let lat_rad = lat.to_radians();
    let y = (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() * Y_FACTOR;

    Point::new(x, y)
}

/// Convert Web Mercator (x, y) in meters to WGS84 (lat, lon)
///
/// # Returns
/// A tuple of (latitude, longitude) in degrees
#[inline(always)]
pub fn mercator_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let lon = x * X_TO_LON_FACTOR;
    let lat =
        (std::f64::consts::PI / 2.0 - 2.0 * ((-y * Y_TO_LAT_FACTOR).exp()).atan()).to_degrees();
    (lat, lon)
}

/// The whole geographic world as a rectangle (lng -180..180, lat -90..90)
#[inline]
pub fn world_bounds() -> Rect<f64> {
    Rect::new(Coord { x: -180.0, y: -90.0 }, Coord { x: 180.0, y: 90.0 })
}

/// Build a geographic rectangle from (min_lat, min_lng, max_lat, max_lng)
#[inline]
pub fn lat_lng_rect(min_lat: f64, min_lng: f64, max_lat: f64, max_lng: f64) -> Rect<f64> {
    Rect::new(
        Coord {
            x: min_lng,
            y: min_lat,
        },
        Coord {
            x: max_lng,
            y: max_lat,
        },
    )
}

/// Degenerate rectangle covering a single position
#[inline]
pub fn point_rect(point: Point<f64>) -> Rect<f64> {
    Rect::new(point.0, point.0)
}

/// Check whether two rectangles intersect (touching edges count)
#[inline]
pub fn rect_intersects(a: Rect<f64>, b: Rect<f64>) -> bool {
    let amin = a.min();
    let amax = a.max();
    let bmin = b.min();
    let bmax = b.max();

    !(amax.x < bmin.x || amin.x > bmax.x || amax.y < bmin.y || amin.y > bmax.y)
}

/// Check whether `outer` fully contains `inner` (shared edges count)
#[inline]
pub fn rect_contains(outer: Rect<f64>, inner: Rect<f64>) -> bool {
    let omin = outer.min();
    let omax = outer.max();
    let imin = inner.min();
    let imax = inner.max();

    imin.x >= omin.x && imax.x <= omax.x && imin.y >= omin.y && imax.y <= omax.y
}

/// Check whether a position lies inside a rectangle (edges included)
#[inline]
pub fn rect_contains_point(rect: Rect<f64>, point: Point<f64>) -> bool {
    let min = rect.min();
    let max = rect.max();
    point.x() >= min.x && point.x() <= max.x && point.y() >= min.y && point.y() <= max.y
}

/// Smallest rectangle covering both inputs
#[inline]
pub fn rect_union(a: Rect<f64>, b: Rect<f64>) -> Rect<f64> {
    Rect::new(
        Coord {
            x: a.min().x.min(b.min().x),
            y: a.min().y.min(b.min().y),
        },
        Coord {
            x: a.max().x.max(b.max().x),
            y: a.max().y.max(b.max().y),
        },
    )
}

/// Grow a geographic rectangle by `fraction` of its size on every side,
/// clipped to the world bounds
pub fn expand_rect(rect: Rect<f64>, fraction: f64) -> Rect<f64> {
    let dx = rect.width() * fraction;
    let dy = rect.height() * fraction;
    Rect::new(
        Coord {
            x: (rect.min().x - dx).max(-180.0),
            y: (rect.min().y - dy).max(-90.0),
        },
        Coord {
            x: (rect.max().x + dx).min(180.0),
            y: (rect.max().y + dy).min(90.0),
        },
    )
}

/// Part of a geographic rectangle that lies inside the world bounds
pub fn clip_to_world(rect: Rect<f64>) -> Option<Rect<f64>> {
    let world = world_bounds();
    if !rect_intersects(world, rect) {
        return None;
    }
    Some(Rect::new(
        Coord {
            x: rect.min().x.max(world.min().x),
            y: rect.min().y.max(world.min().y),
        },
        Coord {
            x: rect.max().x.min(world.max().x),
            y: rect.max().y.min(world.max().y),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_to_world() {
        let clipped = clip_to_world(lat_lng_rect(-100.0, 170.0, 10.0, 200.0)).unwrap();
        assert_eq!(clipped.min(), Coord { x: 170.0, y: -90.0 });
        assert_eq!(clipped.max(), Coord { x: 180.0, y: 10.0 });
        assert!(clip_to_world(lat_lng_rect(0.0, 190.0, 10.0, 200.0)).is_none());
    }

    #[test]
    fn test_wgs84_to_mercator_origin() {
        let point = wgs84_to_mercator(0.0, 0.0);
        assert!((point.x() - 0.0).abs() < 0.01);
        assert!((point.y() - 0.0).abs() < 0.01);
    }

    #[test]
    fn test_wgs84_to_mercator_bounds() {
        let west = wgs84_to_mercator(0.0, -180.0);
        assert!((west.x() - EARTH_MERCATOR_MIN).abs() < 1.0);

        let east = wgs84_to_mercator(0.0, 180.0);
        assert!((east.x() - EARTH_MERCATOR_MAX).abs() < 1.0);
    }

    #[test]
    fn test_mercator_to_wgs84_roundtrip() {
        let lat = 51.5074;
        let lon = -0.1278;

        let mercator = wgs84_to_mercator(lat, lon);
        let (lat2, lon2) = mercator_to_wgs84(mercator.x(), mercator.y());

        assert!((lat - lat2).abs() < 0.0001);
        assert!((lon - lon2).abs() < 0.0001);
    }

    #[test]
    fn test_rect_intersects_touching_edges() {
        let a = lat_lng_rect(0.0, 0.0, 1.0, 1.0);
        let b = lat_lng_rect(1.0, 1.0, 2.0, 2.0);
        let c = lat_lng_rect(1.5, 1.5, 2.0, 2.0);
        assert!(rect_intersects(a, b));
        assert!(!rect_intersects(a, c));
    }

    #[test]
    fn test_rect_intersects_degenerate() {
        let viewport = lat_lng_rect(-1.0, -1.0, 1.0, 1.0);
        let inside = point_rect(Point::new(0.5, 0.5));
        let outside = point_rect(Point::new(5.0, 0.5));
        assert!(rect_intersects(viewport, inside));
        assert!(!rect_intersects(viewport, outside));
    }

    #[test]
    fn test_rect_contains() {
        let outer = lat_lng_rect(-10.0, -10.0, 10.0, 10.0);
        assert!(rect_contains(outer, lat_lng_rect(-10.0, 0.0, 0.0, 10.0)));
        assert!(!rect_contains(outer, lat_lng_rect(-11.0, 0.0, 0.0, 10.0)));
        assert!(rect_contains_point(outer, Point::new(10.0, -10.0)));
    }

    #[test]
    fn test_rect_union() {
        let a = lat_lng_rect(0.0, 0.0, 1.0, 1.0);
        let b = lat_lng_rect(-2.0, 3.0, 0.5, 4.0);
        let u = rect_union(a, b);
        assert_eq!(u.min(), Coord { x: 0.0, y: -2.0 });
        assert_eq!(u.max(), Coord { x: 4.0, y: 1.0 });
    }

    #[test]
    fn test_expand_rect_clips_to_world() {
        let rect = lat_lng_rect(80.0, 170.0, 89.0, 179.0);
        let grown = expand_rect(rect, 0.5);
        assert_eq!(grown.max().x, 180.0);
        assert_eq!(grown.max().y, 90.0);
        assert!((grown.min().x - 165.5).abs() < 1e-9);
        assert!((grown.min().y - 75.5).abs() < 1e-9);
    }
}
