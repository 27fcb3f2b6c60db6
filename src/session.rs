//! Live state of one in-progress navigation.
//!
//! A [`TrackingSession`] is created when navigation starts and dropped when
//! the navigation screen goes away. Position and heading change on every
//! device fix; route and micropoints are swapped together on recalculation.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::arrival::ArrivalDetector;
use crate::densify::{densify, MicropointSet};
use crate::deviation::{DeviationDecision, DeviationMonitor};
use crate::{GeoPoint, NavigationConfig, Route};

/// A single sample from the device location service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct LocationFix {
    pub position: GeoPoint,
    /// Course over ground in degrees, when the device reports one
    pub heading: Option<f64>,
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,
}

impl LocationFix {
    pub fn new(position: GeoPoint, heading: Option<f64>) -> Self {
        Self {
            position,
            heading,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// What changed after applying a location fix.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct SessionUpdate {
    pub position: GeoPoint,
    pub heading: f64,
    /// Whether the camera should track the courier
    pub following: bool,
    /// True only on the fix that first entered the arrival radius
    pub arrived_now: bool,
}

/// Live state of one navigation.
#[derive(Debug, Clone)]
pub struct TrackingSession {
    current_position: GeoPoint,
    heading: f64,
    route: Route,
    micropoints: MicropointSet,
    deviation: DeviationMonitor,
    arrival: ArrivalDetector,
    following: bool,
    config: NavigationConfig,
}

impl TrackingSession {
    /// Start tracking from `start` towards `destination` along `route`.
    pub fn new(
        start: GeoPoint,
        destination: GeoPoint,
        route: Route,
        config: NavigationConfig,
    ) -> Self {
        let micropoints = densify(&route, config.micropoint_step_m);
        Self {
            current_position: start,
            heading: 0.0,
            route,
            micropoints,
            deviation: DeviationMonitor::new(&config),
            arrival: ArrivalDetector::new(destination, config.arrival_radius_m),
            following: true,
            config,
        }
    }

    pub fn current_position(&self) -> GeoPoint {
        self.current_position
    }

    pub fn heading(&self) -> f64 {
        self.heading
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn micropoints(&self) -> &MicropointSet {
        &self.micropoints
    }

    pub fn destination(&self) -> GeoPoint {
        self.arrival.destination()
    }

    pub fn last_stable_position(&self) -> Option<GeoPoint> {
        self.deviation.last_stable_position()
    }

    pub fn arrived(&self) -> bool {
        self.arrival.arrived()
    }

    pub fn following(&self) -> bool {
        self.following
    }

    pub fn config(&self) -> &NavigationConfig {
        &self.config
    }

    /// Apply a device fix. A missing heading keeps the previous one; an
    /// invalid position is skipped and the update reports the current state.
    pub fn on_location(&mut self, fix: &LocationFix) -> SessionUpdate {
        let arrived_now = if fix.position.is_valid() {
            self.current_position = fix.position;
            if let Some(heading) = fix.heading.filter(|h| h.is_finite()) {
                self.heading = heading;
            }
            self.arrival.update(&fix.position)
        } else {
            warn!(
                "[TrackingSession] Skipping invalid fix ({}, {})",
                fix.position.latitude, fix.position.longitude
            );
            false
        };

        SessionUpdate {
            position: self.current_position,
            heading: self.heading,
            following: self.following,
            arrived_now,
        }
    }

    /// Run one deviation check against the current position.
    pub fn check_deviation(&mut self) -> Option<DeviationDecision> {
        self.deviation
            .check(&self.current_position, &self.route, &self.micropoints)
    }

    /// Run one deviation check; returns the origin for a new route when a
    /// recalculation is warranted.
    pub fn tick(&mut self) -> Option<GeoPoint> {
        match self.check_deviation()? {
            DeviationDecision::Recalculate { origin, .. } => Some(origin),
            _ => None,
        }
    }

    /// Swap in a freshly fetched route. The micropoints are rebuilt first so
    /// route and micropoints always change together.
    pub fn replace_route(&mut self, route: Route) {
        let micropoints = densify(&route, self.config.micropoint_step_m);
        self.route = route;
        self.micropoints = micropoints;
    }

    /// User dragged the map: stop moving the camera with the courier.
    pub fn pan(&mut self) {
        self.following = false;
    }

    /// User asked to re-center: track the courier again.
    pub fn recenter(&mut self) {
        self.following = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_meters;

    fn setup() -> (TrackingSession, Route) {
        let start = GeoPoint::new(55.3959, 10.3883);
        let route = Route::new(
            (0..5)
                .map(|i| offset_meters(&start, i as f64 * 125.0, 0.0))
                .collect(),
        )
        .unwrap();
        let destination = route.destination();
        let session =
            TrackingSession::new(start, destination, route.clone(), NavigationConfig::default());
        (session, route)
    }

    #[test]
    fn test_heading_falls_back_to_previous() {
        let (mut session, route) = setup();
        session.on_location(&LocationFix::new(route.points()[1], Some(12.0)));
        let update = session.on_location(&LocationFix::new(route.points()[1], None));
        assert_eq!(update.heading, 12.0);
        assert_eq!(session.heading(), 12.0);
    }

    #[test]
    fn test_follow_toggle() {
        let (mut session, route) = setup();
        assert!(session.following());
        session.pan();
        let update = session.on_location(&LocationFix::new(route.points()[1], None));
        assert!(!update.following);
        session.recenter();
        assert!(session.following());
    }

    #[test]
    fn test_replace_route_rebuilds_micropoints() {
        let (mut session, route) = setup();
        let before = session.micropoints().len();
        assert!(before > 0);

        let short = Route::new(vec![route.points()[3], route.points()[4]]).unwrap();
        session.replace_route(short.clone());
        assert_eq!(session.route(), &short);
        assert!(session.micropoints().len() < before);
        assert_eq!(
            session.micropoints(),
            &densify(&short, NavigationConfig::default().micropoint_step_m)
        );
    }

    #[test]
    fn test_arrival_signal_once() {
        let (mut session, route) = setup();
        let destination = route.destination();

        let near = session.on_location(&LocationFix::new(offset_meters(&destination, 5.0, 0.0), None));
        assert!(near.arrived_now);
        let again = session.on_location(&LocationFix::new(destination, None));
        assert!(!again.arrived_now);
        assert!(session.arrived());
    }

    #[test]
    fn test_invalid_fix_does_not_poison_deviation() {
        let (mut session, route) = setup();
        let off = offset_meters(&route.points()[2], 0.0, 15.0);
        session.on_location(&LocationFix::new(off, Some(30.0)));
        assert!(session.tick().is_none());

        let update = session.on_location(&LocationFix::new(GeoPoint::new(f64::NAN, 10.0), Some(90.0)));
        assert_eq!(update.position, off);
        assert_eq!(update.heading, 30.0);
        assert!(session.tick().is_none());
        assert_eq!(session.last_stable_position(), Some(off));

        let moved = offset_meters(&off, 11.0, 0.0);
        session.on_location(&LocationFix::new(moved, None));
        assert_eq!(session.tick(), Some(moved));
    }

    #[test]
    fn test_tick_reports_origin() {
        let (mut session, route) = setup();
        let off = offset_meters(&route.points()[2], 0.0, 15.0);
        session.on_location(&LocationFix::new(off, None));
        assert!(session.tick().is_none());

        let moved = offset_meters(&off, 11.0, 0.0);
        session.on_location(&LocationFix::new(moved, None));
        assert_eq!(session.tick(), Some(moved));
    }
}
