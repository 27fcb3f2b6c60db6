//! Route densification into "micropoints".
//!
//! A directions provider returns sparse polylines: a long straight street
//! may be a single segment. Deviation checks measure distance to points, so
//! sparse segments are filled in with synthetic points at a fixed step.

use geo::Coord;

use crate::geo_utils::distance_meters;
use crate::{GeoPoint, Route};

/// Default spacing between micropoints in meters.
pub const DEFAULT_STEP_M: f64 = 10.0;

/// Smallest spacing accepted from callers outside the crate.
pub const MIN_STEP_M: f64 = 1.0;

/// Synthetic points derived from a [`Route`]. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MicropointSet {
    points: Vec<GeoPoint>,
}

impl MicropointSet {
    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Points strictly between `a` and `b`, spaced `step_m` apart.
///
/// Segments of `2 * step_m` or less yield nothing. Otherwise
/// `floor(distance / step_m) - 1` points are produced by linear blending of
/// latitude/longitude, excluding both endpoints.
pub fn interpolate(a: &GeoPoint, b: &GeoPoint, step_m: f64) -> Vec<GeoPoint> {
    let distance = distance_meters(a, b);
    if !(step_m > 0.0) || distance <= 2.0 * step_m {
        return Vec::new();
    }

    let steps = (distance / step_m).floor() as usize;
    let start = Coord::from(*a);
    let delta = Coord::from(*b) - start;

    (1..steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            GeoPoint::from(start + delta * t)
        })
        .collect()
}

/// Micropoints for every consecutive vertex pair of `route`, in route order.
pub fn densify(route: &Route, step_m: f64) -> MicropointSet {
    let points = route
        .points()
        .windows(2)
        .flat_map(|pair| interpolate(&pair[0], &pair[1], step_m))
        .collect();
    MicropointSet { points }
}
