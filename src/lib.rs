//! # Courier Nav
//!
//! Live navigation and position reporting for a delivery courier app.
//!
//! This library provides:
//! - Geospatial utilities (Haversine distance, nearest-point search)
//! - Route densification into micropoints for fine-grained deviation checks
//! - A deviation monitor that decides when a route must be recalculated
//! - One-shot arrival detection
//! - A navigator task that ties the above to a routing provider
//! - A self-healing live position channel to the backend
//!
//! ## Features
//!
//! - **`http`** (default) - Directions/geocoding client, backend REST client, WebSocket connector
//! - **`persistence`** - SQLite key-value store for the courier's local state
//! - **`ffi`** - FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use courier_nav::{GeoPoint, Route, NavigationConfig, TrackingSession};
//!
//! let route = Route::new(vec![
//!     GeoPoint::new(55.3959, 10.3883),
//!     GeoPoint::new(55.3969, 10.3883),
//!     GeoPoint::new(55.3979, 10.3883),
//! ]).unwrap();
//!
//! let (start, destination) = (route.origin(), route.destination());
//! let mut session = TrackingSession::new(start, destination, route, NavigationConfig::default());
//!
//! // On route: no recalculation needed
//! assert!(session.tick().is_none());
//! ```

use geo::{Coord, LineString};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{NavError, OptionExt, Result};

// Geographic utilities (distance, nearest point)
pub mod geo_utils;
pub use geo_utils::{closest_index, distance_meters, nearest_point, ClosestPoint, PointSource};

// Route densification (micropoints)
pub mod densify;
pub use densify::{densify, interpolate, MicropointSet};

// Off-route detection with two-stage debounce
pub mod deviation;
pub use deviation::{DeviationDecision, DeviationMonitor};

// One-shot arrival detection
pub mod arrival;
pub use arrival::ArrivalDetector;

// Live state of one navigation
pub mod session;
pub use session::{LocationFix, SessionUpdate, TrackingSession};

// Key-value storage for persisted local state
pub mod store;
pub use store::{KeyValueStore, MemoryStore};
#[cfg(feature = "persistence")]
pub use store::SqliteStore;

// Shared courier state with change notification
pub mod context;
pub use context::{CourierContext, OrderSnapshot};

// Access/refresh tokens
pub mod auth;
pub use auth::{CredentialStore, RefreshMode, TokenPair, TokenRefresher};

// Directions and geocoding
pub mod provider;
pub use provider::{RouteCache, RouteProvider};
#[cfg(feature = "http")]
pub use provider::{OrsClient, ProviderConfig};

// Backend REST client
#[cfg(feature = "http")]
pub mod api;
#[cfg(feature = "http")]
pub use api::{BackendClient, BackendConfig};

// Navigation task driving a TrackingSession
pub mod navigator;
pub use navigator::{NavigationEvent, NavigationHandle, Navigator};

// Live position channel (WebSocket to the backend)
pub mod channel;
pub use channel::{ChannelConfig, ChannelState, ConnectionManager, Endpoint};

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("CourierNav"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// Compared by derived distance, never by identity.
///
/// # Example
/// ```
/// use courier_nav::GeoPoint;
/// let point = GeoPoint::new(55.3959, 10.3883); // Odense
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// Build from a `[longitude, latitude]` pair as used by GeoJSON.
    pub fn from_lng_lat(pair: [f64; 2]) -> Self {
        Self::new(pair[1], pair[0])
    }
}

impl From<GeoPoint> for Coord<f64> {
    fn from(p: GeoPoint) -> Self {
        Coord {
            x: p.longitude,
            y: p.latitude,
        }
    }
}

impl From<Coord<f64>> for GeoPoint {
    fn from(c: Coord<f64>) -> Self {
        GeoPoint::new(c.y, c.x)
    }
}

/// An ordered, non-empty polyline from origin (index 0) to destination (last).
///
/// Produced wholesale by a route provider and replaced, never mutated, on
/// recalculation. Indices are not stable across recalculations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<GeoPoint>", into = "Vec<GeoPoint>")]
pub struct Route {
    points: Vec<GeoPoint>,
}

impl Route {
    /// Create a route from its vertices. Fails on an empty polyline.
    pub fn new(points: Vec<GeoPoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(NavError::route_unavailable("route has no vertices"));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn origin(&self) -> GeoPoint {
        self.points[0]
    }

    pub fn destination(&self) -> GeoPoint {
        self.points[self.points.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false; kept for API symmetry with slices.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Total length along the polyline in meters.
    pub fn length_meters(&self) -> f64 {
        self.points
            .windows(2)
            .map(|pair| distance_meters(&pair[0], &pair[1]))
            .sum()
    }

    /// The route as a `geo` line string (x = longitude, y = latitude).
    pub fn to_line_string(&self) -> LineString<f64> {
        self.points.iter().map(|p| Coord::from(*p)).collect()
    }
}

impl TryFrom<Vec<GeoPoint>> for Route {
    type Error = NavError;

    fn try_from(points: Vec<GeoPoint>) -> Result<Self> {
        Route::new(points)
    }
}

impl From<Route> for Vec<GeoPoint> {
    fn from(route: Route) -> Self {
        route.points
    }
}

/// Tunables for a navigation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct NavigationConfig {
    /// Distance to the nearest route point above which the courier is off-route.
    /// Default: 10.0 meters
    pub off_route_threshold_m: f64,

    /// Displacement since the last off-route sample needed to trigger a recalculation.
    /// Default: 10.0 meters
    pub stable_displacement_m: f64,

    /// Radius around the destination that counts as arrived.
    /// Default: 10.0 meters
    pub arrival_radius_m: f64,

    /// Spacing of synthetic micropoints between route vertices.
    /// Default: 10.0 meters
    pub micropoint_step_m: f64,

    /// Deviation check cadence.
    /// Default: 1000 ms (1 Hz)
    pub tick_interval_ms: u64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            off_route_threshold_m: 10.0,
            stable_displacement_m: 10.0,
            arrival_radius_m: 10.0,
            micropoint_step_m: densify::DEFAULT_STEP_M,
            tick_interval_ms: 1000,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
