//! FFI bindings for mobile platforms (iOS/Android).
//!
//! This module provides the UniFFI bindings that expose the navigation core
//! to Kotlin and Swift. Free functions are prefixed with `ffi_` to avoid
//! naming conflicts with the internal API.
//!
//! The host app owns the location subscription and timers; it feeds fixes
//! into a [`TrackingSessionHandle`] and calls `tick()` once per second.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::densify::{densify, MIN_STEP_M};
use crate::session::{LocationFix, SessionUpdate, TrackingSession};
use crate::{distance_meters, init_logging, GeoPoint, NavError, NavigationConfig, Route};

// ============================================================================
// Geometry
// ============================================================================

/// Great-circle distance between two points in meters.
#[uniffi::export]
pub fn ffi_distance_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    distance_meters(&a, &b)
}

/// Micropoints for a route polyline, `step_m` apart. Empty for an empty
/// polyline or a step below one meter.
#[uniffi::export]
pub fn ffi_densify_route(points: Vec<GeoPoint>, step_m: f64) -> Vec<GeoPoint> {
    init_logging();
    if step_m.is_nan() || step_m < MIN_STEP_M {
        warn!("[CourierNav] Refusing to densify with step {}m", step_m);
        return Vec::new();
    }
    match Route::new(points) {
        Ok(route) => {
            let micropoints = densify(&route, step_m);
            debug!(
                "[CourierNav] Densified {} vertices into {} micropoints",
                route.len(),
                micropoints.len()
            );
            micropoints.points().to_vec()
        }
        Err(_) => Vec::new(),
    }
}

/// Default navigation tunables (10 m thresholds, 1 Hz tick).
#[uniffi::export]
pub fn ffi_default_navigation_config() -> NavigationConfig {
    NavigationConfig::default()
}

// ============================================================================
// Tracking session
// ============================================================================

/// A [`TrackingSession`] shared with the host app.
#[derive(uniffi::Object)]
pub struct TrackingSessionHandle {
    session: Mutex<TrackingSession>,
}

impl TrackingSessionHandle {
    fn session(&self) -> MutexGuard<'_, TrackingSession> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[uniffi::export]
impl TrackingSessionHandle {
    /// Start tracking from `start` along the fetched `route`.
    #[uniffi::constructor]
    pub fn new(
        start: GeoPoint,
        destination: GeoPoint,
        route: Vec<GeoPoint>,
        config: NavigationConfig,
    ) -> Result<Arc<Self>, NavError> {
        init_logging();
        if config.micropoint_step_m.is_nan() || config.micropoint_step_m < MIN_STEP_M {
            return Err(NavError::Config {
                message: format!(
                    "micropoint step must be at least {}m, got {}",
                    MIN_STEP_M, config.micropoint_step_m
                ),
            });
        }
        let route = Route::new(route)?;
        info!(
            "[CourierNav] Tracking session started: {} route points, {:.0}m",
            route.len(),
            route.length_meters()
        );
        Ok(Arc::new(Self {
            session: Mutex::new(TrackingSession::new(start, destination, route, config)),
        }))
    }

    /// Apply a device fix. `arrived_now` is true exactly once per session.
    pub fn on_location(&self, fix: LocationFix) -> SessionUpdate {
        self.session().on_location(&fix)
    }

    /// One deviation check. Returns the origin to fetch a new route from
    /// when recalculation is needed.
    pub fn tick(&self) -> Option<GeoPoint> {
        let origin = self.session().tick();
        if let Some(origin) = origin {
            info!("[CourierNav] Recalculation needed from {:?}", origin);
        }
        origin
    }

    /// Swap in a recalculated route.
    pub fn replace_route(&self, route: Vec<GeoPoint>) -> Result<(), NavError> {
        let route = Route::new(route)?;
        self.session().replace_route(route);
        Ok(())
    }

    pub fn pan(&self) {
        self.session().pan();
    }

    pub fn recenter(&self) {
        self.session().recenter();
    }

    pub fn following(&self) -> bool {
        self.session().following()
    }

    pub fn arrived(&self) -> bool {
        self.session().arrived()
    }

    pub fn current_position(&self) -> GeoPoint {
        self.session().current_position()
    }

    pub fn route(&self) -> Vec<GeoPoint> {
        self.session().route().points().to_vec()
    }

    pub fn micropoints(&self) -> Vec<GeoPoint> {
        self.session().micropoints().points().to_vec()
    }
}
