//! Geographic utilities: great-circle distance and nearest-point search.

use serde::{Deserialize, Serialize};

use crate::GeoPoint;

/// Mean Earth radius used by [`distance_meters`], in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points using the Haversine formula.
///
/// # Example
/// ```
/// use courier_nav::GeoPoint;
/// use courier_nav::geo_utils::distance_meters;
///
/// let a = GeoPoint::new(55.3959, 10.3883);
/// assert_eq!(distance_meters(&a, &a), 0.0);
/// ```
pub fn distance_meters(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlng = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    // Clamp guards against h drifting past 1.0 through rounding
    let c = 2.0 * h.sqrt().min(1.0).asin();

    EARTH_RADIUS_M * c
}

/// Index of the point in `points` nearest to `point`.
///
/// Ties resolve to the lowest index. Returns `None` for an empty slice.
pub fn closest_index(point: &GeoPoint, points: &[GeoPoint]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, candidate) in points.iter().enumerate() {
        let d = distance_meters(point, candidate);
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((i, d)),
        }
    }
    best.map(|(i, _)| i)
}

/// Which point set a nearest point came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum PointSource {
    /// A vertex of the planned route
    Vertex(usize),
    /// A synthesized micropoint
    Micropoint(usize),
}

/// Nearest point found across the route vertices and micropoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClosestPoint {
    pub point: GeoPoint,
    pub distance: f64,
    pub source: PointSource,
}

/// Nearest point over the union of `vertices` and `micropoints`.
///
/// A single scan in the order vertices-then-micropoints with a strict
/// less-than comparison, so on an exact tie the route vertex wins, and
/// among equals the lowest index wins.
pub fn nearest_point(
    point: &GeoPoint,
    vertices: &[GeoPoint],
    micropoints: &[GeoPoint],
) -> Option<ClosestPoint> {
    let candidates = vertices
        .iter()
        .enumerate()
        .map(|(i, p)| (p, PointSource::Vertex(i)))
        .chain(
            micropoints
                .iter()
                .enumerate()
                .map(|(i, p)| (p, PointSource::Micropoint(i))),
        );

    let mut best: Option<ClosestPoint> = None;
    for (candidate, source) in candidates {
        let distance = distance_meters(point, candidate);
        if best.map_or(true, |b| distance < b.distance) {
            best = Some(ClosestPoint {
                point: *candidate,
                distance,
                source,
            });
        }
    }
    best
}

/// Shift a point by a small north/east displacement in meters.
///
/// Uses an equirectangular approximation, accurate to well under a meter
/// for displacements of a few kilometers away from the poles.
pub fn offset_meters(point: &GeoPoint, north_m: f64, east_m: f64) -> GeoPoint {
    let dlat = (north_m / EARTH_RADIUS_M).to_degrees();
    let dlng = (east_m / (EARTH_RADIUS_M * point.latitude.to_radians().cos())).to_degrees();
    GeoPoint::new(point.latitude + dlat, point.longitude + dlng)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn odense() -> GeoPoint {
        GeoPoint::new(55.3959, 10.3883)
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = odense();
        assert_eq!(distance_meters(&a, &a), 0.0);
        let b = GeoPoint::new(-33.8688, 151.2093);
        assert_eq!(distance_meters(&b, &b), 0.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = odense();
        let b = GeoPoint::new(55.6761, 12.5683);
        let ab = distance_meters(&a, &b);
        let ba = distance_meters(&b, &a);
        assert!((ab - ba).abs() < 1e-6, "{} vs {}", ab, ba);
    }

    #[test]
    fn test_distance_ten_kilometers() {
        let a = odense();
        let b = offset_meters(&a, 0.0, 10_000.0);
        let d = distance_meters(&a, &b);
        assert!((d - 10_000.0).abs() < 100.0, "Expected ~10km, got {}", d);

        let c = offset_meters(&a, 10_000.0, 0.0);
        let d = distance_meters(&a, &c);
        assert!((d - 10_000.0).abs() < 100.0, "Expected ~10km, got {}", d);
    }

    #[test]
    fn test_closest_index_first_on_tie() {
        let p = odense();
        let route = vec![
            offset_meters(&p, 50.0, 0.0),
            offset_meters(&p, 5.0, 0.0),
            offset_meters(&p, 5.0, 0.0),
        ];
        assert_eq!(closest_index(&p, &route), Some(1));
        assert_eq!(closest_index(&p, &[]), None);
    }

    #[test]
    fn test_nearest_point_prefers_vertex_on_tie() {
        let p = odense();
        let shared = offset_meters(&p, 20.0, 0.0);
        let vertices = vec![offset_meters(&p, 100.0, 0.0), shared];
        let micropoints = vec![shared, offset_meters(&p, 60.0, 0.0)];

        let nearest = nearest_point(&p, &vertices, &micropoints).unwrap();
        assert_eq!(nearest.source, PointSource::Vertex(1));
    }

    #[test]
    fn test_nearest_point_uses_micropoints() {
        let p = odense();
        let vertices = vec![offset_meters(&p, -100.0, 0.0), offset_meters(&p, 100.0, 0.0)];
        let micropoints = vec![offset_meters(&p, 2.0, 0.0)];

        let nearest = nearest_point(&p, &vertices, &micropoints).unwrap();
        assert_eq!(nearest.source, PointSource::Micropoint(0));
        assert!(nearest.distance < 3.0);
        assert!(nearest_point(&p, &[], &[]).is_none());
    }
}
