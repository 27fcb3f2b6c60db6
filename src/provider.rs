//! Directions and geocoding.
//!
//! [`RouteProvider`] is the seam to the external routing service. The
//! OpenRouteService-compatible HTTP client lives behind the `http` feature;
//! tests and host apps can plug in their own provider.
//!
//! Geocoding results are cached per exact address string in a
//! [`RouteCache`] for as long as the cache lives (normally the app session),
//! since geocoding calls are rate-limited and billed.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;

use crate::{GeoPoint, NavError, OptionExt, Result, Route};

/// Source of routes and coordinates.
#[async_trait]
pub trait RouteProvider: Send + Sync {
    /// Fetch a route from `origin` to `destination`.
    ///
    /// Fails with [`NavError::RouteUnavailable`] if the provider returns no
    /// usable geometry.
    async fn fetch_route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<Route>;

    /// Resolve a free-text address. Fails with [`NavError::NotFound`] when
    /// the provider has no match.
    async fn geocode(&self, address: &str) -> Result<GeoPoint>;
}

// ============================================================================
// Response parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct FeatureCollection<G> {
    #[serde(default = "Vec::new")]
    features: Vec<Feature<G>>,
}

#[derive(Debug, Deserialize)]
struct Feature<G> {
    geometry: Option<G>,
}

#[derive(Debug, Deserialize)]
struct LineGeometry {
    coordinates: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct PointGeometry {
    coordinates: Vec<f64>,
}

/// `[lng, lat, (ele)]` to a valid point, or `None`.
fn position_to_point(position: &[f64]) -> Option<GeoPoint> {
    match position {
        [lng, lat, ..] => Some(GeoPoint::new(*lat, *lng)).filter(|p| p.is_valid()),
        _ => None,
    }
}

/// Parse a GeoJSON directions response into a route.
///
/// The first feature's `geometry.coordinates` (`[[lng, lat], ...]`) is used.
/// Invalid positions are dropped; no remaining positions means no route.
pub fn parse_directions(body: &str) -> Result<Route> {
    let collection: FeatureCollection<LineGeometry> = serde_json::from_str(body)
        .map_err(|e| NavError::route_unavailable(format!("malformed directions response: {}", e)))?;

    let geometry = collection
        .features
        .into_iter()
        .next()
        .and_then(|f| f.geometry)
        .ok_or_route_unavailable("directions response has no geometry")?;

    let points: Vec<GeoPoint> = geometry
        .coordinates
        .iter()
        .filter_map(|c| position_to_point(c))
        .collect();

    Route::new(points)
}

/// Parse a GeoJSON geocoding response; the first feature wins.
pub fn parse_geocode(body: &str, address: &str) -> Result<GeoPoint> {
    let not_found = || NavError::NotFound {
        address: address.to_string(),
    };

    let collection: FeatureCollection<PointGeometry> = serde_json::from_str(body).map_err(|e| {
        warn!("[RouteProvider] Malformed geocode response for '{}': {}", address, e);
        not_found()
    })?;

    collection
        .features
        .into_iter()
        .next()
        .and_then(|f| f.geometry)
        .and_then(|g| position_to_point(&g.coordinates))
        .ok_or_else(not_found)
}

// ============================================================================
// Geocode cache
// ============================================================================

/// Process-lifetime geocode cache, keyed by the exact address string.
///
/// Only successful lookups are cached; a `NotFound` is retried next time.
#[derive(Debug, Default)]
pub struct RouteCache {
    geocodes: Mutex<HashMap<String, GeoPoint>>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached coordinates for `address`, if any.
    pub fn cached(&self, address: &str) -> Option<GeoPoint> {
        self.geocodes
            .lock()
            .ok()
            .and_then(|cache| cache.get(address).copied())
    }

    /// Resolve `address`, consulting the cache before `provider`.
    pub async fn geocode(&self, provider: &dyn RouteProvider, address: &str) -> Result<GeoPoint> {
        if let Some(point) = self.cached(address) {
            debug!("[RouteCache] Geocode hit for '{}'", address);
            return Ok(point);
        }

        let point = provider.geocode(address).await?;
        if let Ok(mut cache) = self.geocodes.lock() {
            cache.insert(address.to_string(), point);
        }
        Ok(point)
    }

    pub fn len(&self) -> usize {
        self.geocodes.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.geocodes.lock() {
            cache.clear();
        }
    }
}

// ============================================================================
// OpenRouteService client
// ============================================================================

#[cfg(feature = "http")]
pub use ors::{OrsClient, ProviderConfig};

#[cfg(feature = "http")]
mod ors {
    use std::time::Duration;

    use async_trait::async_trait;
    use log::{debug, info, warn};
    use reqwest::Client;
    use serde::{Deserialize, Serialize};

    use super::{parse_directions, parse_geocode, RouteProvider};
    use crate::{GeoPoint, NavError, Result, Route};

    /// Directions/geocoding service settings.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ProviderConfig {
        /// Default: https://api.openrouteservice.org
        pub base_url: String,
        pub api_key: String,
        /// Routing profile. Default: driving-car
        pub profile: String,
        /// Default: 30 seconds
        pub timeout_secs: u64,
    }

    impl Default for ProviderConfig {
        fn default() -> Self {
            Self {
                base_url: "https://api.openrouteservice.org".to_string(),
                api_key: String::new(),
                profile: "driving-car".to_string(),
                timeout_secs: 30,
            }
        }
    }

    /// OpenRouteService-compatible HTTP provider.
    pub struct OrsClient {
        client: Client,
        config: ProviderConfig,
    }

    impl OrsClient {
        pub fn new(config: ProviderConfig) -> Result<Self> {
            if config.api_key.is_empty() {
                return Err(NavError::Config {
                    message: "routing provider api_key is empty".to_string(),
                });
            }
            let client = Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .map_err(|e| NavError::Config {
                    message: format!("Failed to create HTTP client: {}", e),
                })?;

            Ok(Self { client, config })
        }

        fn url(&self, path: &str) -> String {
            format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
        }

        async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String> {
            let response = self
                .client
                .get(url)
                .query(&[("api_key", self.config.api_key.as_str())])
                .query(query)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(NavError::Http {
                    message: format!("HTTP {}", status),
                    status_code: Some(status.as_u16()),
                });
            }
            Ok(response.text().await?)
        }
    }

    fn lng_lat(p: &GeoPoint) -> String {
        format!("{},{}", p.longitude, p.latitude)
    }

    #[async_trait]
    impl RouteProvider for OrsClient {
        async fn fetch_route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<Route> {
            let url = self.url(&format!("v2/directions/{}", self.config.profile));
            let body = self
                .get_text(
                    &url,
                    &[("start", lng_lat(&origin)), ("end", lng_lat(&destination))],
                )
                .await?;

            match parse_directions(&body) {
                Ok(route) => {
                    info!(
                        "[RouteProvider] Route with {} vertices ({:.0}m)",
                        route.len(),
                        route.length_meters()
                    );
                    Ok(route)
                }
                Err(e) => {
                    warn!("[RouteProvider] {}", e);
                    Err(e)
                }
            }
        }

        async fn geocode(&self, address: &str) -> Result<GeoPoint> {
            let url = self.url("geocode/search");
            let body = self
                .get_text(&url, &[("text", address.to_string())])
                .await?;
            let point = parse_geocode(&body, address)?;
            debug!(
                "[RouteProvider] Geocoded '{}' -> {:.5},{:.5}",
                address, point.latitude, point.longitude
            );
            Ok(point)
        }
    }

}
