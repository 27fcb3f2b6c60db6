//! Off-route detection.
//!
//! Runs once per tick against the current position. A recalculation needs
//! two things: the courier is farther than the off-route threshold from
//! every route vertex and micropoint, AND has moved more than the
//! displacement threshold since the last off-route sample was recorded.
//! The second condition damps single-sample GPS jitter and keeps a
//! stationary off-route courier from triggering a recalculation each tick.

use log::debug;

use crate::densify::MicropointSet;
use crate::geo_utils::{distance_meters, nearest_point, ClosestPoint};
use crate::{GeoPoint, NavigationConfig, Route};

/// Outcome of one deviation check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviationDecision {
    /// Within the threshold of the route.
    OnRoute { closest: ClosestPoint },
    /// First off-route sample; recorded as the stable position.
    Recorded { closest: ClosestPoint },
    /// Off-route but not moved enough since the last recorded sample.
    Holding { closest: ClosestPoint, displacement: f64 },
    /// Off-route and moving: fetch a new route from `origin`.
    Recalculate { origin: GeoPoint, closest: ClosestPoint },
}

impl DeviationDecision {
    pub fn should_recalculate(&self) -> bool {
        matches!(self, DeviationDecision::Recalculate { .. })
    }
}

/// Debounce state for off-route detection.
#[derive(Debug, Clone)]
pub struct DeviationMonitor {
    off_route_threshold_m: f64,
    stable_displacement_m: f64,
    last_stable_position: Option<GeoPoint>,
}

impl DeviationMonitor {
    pub fn new(config: &NavigationConfig) -> Self {
        Self {
            off_route_threshold_m: config.off_route_threshold_m,
            stable_displacement_m: config.stable_displacement_m,
            last_stable_position: None,
        }
    }

    pub fn last_stable_position(&self) -> Option<GeoPoint> {
        self.last_stable_position
    }

    /// Evaluate one tick. The debounce state is updated before returning, so
    /// a `Recalculate` decision is never repeated for the same position even
    /// if the caller's fetch is still pending.
    ///
    /// Returns `None` only when both point sets are empty.
    pub fn check(
        &mut self,
        position: &GeoPoint,
        route: &Route,
        micropoints: &MicropointSet,
    ) -> Option<DeviationDecision> {
        let closest = nearest_point(position, route.points(), micropoints.points())?;

        if closest.distance <= self.off_route_threshold_m {
            return Some(DeviationDecision::OnRoute { closest });
        }

        let decision = match self.last_stable_position {
            None => {
                self.last_stable_position = Some(*position);
                DeviationDecision::Recorded { closest }
            }
            Some(stable) => {
                let displacement = distance_meters(&stable, position);
                if displacement > self.stable_displacement_m {
                    self.last_stable_position = Some(*position);
                    DeviationDecision::Recalculate {
                        origin: *position,
                        closest,
                    }
                } else {
                    DeviationDecision::Holding {
                        closest,
                        displacement,
                    }
                }
            }
        };

        debug!(
            "[DeviationMonitor] {:.1}m off route -> {:?}",
            closest.distance, decision
        );
        Some(decision)
    }
}
