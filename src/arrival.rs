//! One-shot arrival detection.

use log::info;

use crate::geo_utils::distance_meters;
use crate::GeoPoint;

/// Fires once when the courier first comes within the arrival radius.
///
/// There is no reset: a new detector (new session) is needed to re-arm.
#[derive(Debug, Clone)]
pub struct ArrivalDetector {
    destination: GeoPoint,
    radius_m: f64,
    arrived: bool,
}

impl ArrivalDetector {
    pub fn new(destination: GeoPoint, radius_m: f64) -> Self {
        Self {
            destination,
            radius_m,
            arrived: false,
        }
    }

    pub fn destination(&self) -> GeoPoint {
        self.destination
    }

    pub fn arrived(&self) -> bool {
        self.arrived
    }

    /// Returns true exactly once: on the first update inside the radius.
    pub fn update(&mut self, position: &GeoPoint) -> bool {
        if self.arrived {
            return false;
        }
        let distance = distance_meters(position, &self.destination);
        if distance <= self.radius_m {
            info!("[ArrivalDetector] Arrived ({:.1}m from destination)", distance);
            self.arrived = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_meters;

    #[test]
    fn test_fires_once() {
        let destination = GeoPoint::new(55.3959, 10.3883);
        let mut detector = ArrivalDetector::new(destination, 10.0);

        assert!(!detector.update(&offset_meters(&destination, 40.0, 0.0)));
        assert!(!detector.update(&offset_meters(&destination, 15.0, 0.0)));
        assert!(!detector.arrived());

        assert!(detector.update(&offset_meters(&destination, 8.0, 0.0)));
        assert!(detector.arrived());

        // Leave and come back: no second signal
        assert!(!detector.update(&offset_meters(&destination, 60.0, 0.0)));
        assert!(!detector.update(&destination));
        assert!(detector.arrived());
    }
}
