//! # Navigator
//!
//! Async driver around a [`TrackingSession`].
//!
//! The task resolves the destination, fetches the initial route and then
//! multiplexes device fixes from the [`CourierContext`], the deviation tick
//! and camera commands. A recalculation is awaited inside the loop, so the
//! next tick cannot start before the previous fetch finished; the monitor
//! has already recorded the new stable position by then, so the same
//! position never triggers twice.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::context::CourierContext;
use crate::provider::{RouteCache, RouteProvider};
use crate::session::{LocationFix, SessionUpdate, TrackingSession};
use crate::{GeoPoint, NavigationConfig, OptionExt, Result, Route};

/// Something the UI should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationEvent {
    /// A device fix was applied.
    PositionChanged(SessionUpdate),
    /// The courier left the route; a new one is being fetched from `origin`.
    Recalculating { origin: GeoPoint },
    /// A recalculated route replaced the old one.
    RouteUpdated(Route),
    /// Recalculation failed; the previous route stays in place.
    RouteUnavailable { message: String },
    /// Camera follow mode changed.
    FollowChanged { following: bool },
    /// The courier entered the arrival radius. Emitted once.
    Arrived,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Pan,
    Recenter,
}

/// Owner of a running navigation. Dropping it stops the task.
#[derive(Debug)]
pub struct NavigationHandle {
    route: Route,
    destination: GeoPoint,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<NavigationEvent>,
    task: JoinHandle<()>,
}

impl NavigationHandle {
    /// The route fetched at start.
    pub fn initial_route(&self) -> &Route {
        &self.route
    }

    pub fn destination(&self) -> GeoPoint {
        self.destination
    }

    /// Next event, or `None` once the task has stopped.
    pub async fn next_event(&mut self) -> Option<NavigationEvent> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<NavigationEvent> {
        self.events.try_recv().ok()
    }

    pub fn pan(&self) {
        let _ = self.commands.send(Command::Pan);
    }

    pub fn recenter(&self) {
        let _ = self.commands.send(Command::Recenter);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for NavigationHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts navigation tasks.
pub struct Navigator;

impl Navigator {
    /// Navigate from the context's last known position to `destination`.
    ///
    /// Fails if no position has been recorded yet or the initial route
    /// cannot be fetched. Later fetch failures are reported as
    /// [`NavigationEvent::RouteUnavailable`].
    pub async fn start(
        provider: Arc<dyn RouteProvider>,
        context: &CourierContext,
        destination: GeoPoint,
        config: NavigationConfig,
    ) -> Result<NavigationHandle> {
        let start = context
            .last_position()
            .ok_or_internal("no device position recorded yet")?;

        let route = provider.fetch_route(start, destination).await?;
        info!(
            "[Navigator] Route with {} points ({:.0}m) to {:?}",
            route.len(),
            route.length_meters(),
            destination
        );

        let session = TrackingSession::new(start, destination, route.clone(), config);
        let fixes = context.subscribe_fixes();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run(session, provider, fixes, command_rx, event_tx));

        Ok(NavigationHandle {
            route,
            destination,
            commands: command_tx,
            events: event_rx,
            task,
        })
    }

    /// Geocode `address` (through `cache`) and navigate there.
    pub async fn start_to_address(
        provider: Arc<dyn RouteProvider>,
        cache: &RouteCache,
        context: &CourierContext,
        address: &str,
        config: NavigationConfig,
    ) -> Result<NavigationHandle> {
        let destination = cache.geocode(provider.as_ref(), address).await?;
        debug!("[Navigator] '{}' resolved to {:?}", address, destination);
        Self::start(provider, context, destination, config).await
    }
}

async fn run(
    mut session: TrackingSession,
    provider: Arc<dyn RouteProvider>,
    mut fixes: watch::Receiver<Option<LocationFix>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<NavigationEvent>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(
        session.config().tick_interval_ms.max(1),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let emit = |event: NavigationEvent| {
        let _ = events.send(event);
    };

    loop {
        tokio::select! {
            changed = fixes.changed() => {
                if changed.is_err() {
                    debug!("[Navigator] Position source gone, stopping");
                    break;
                }
                let fix = *fixes.borrow_and_update();
                if let Some(fix) = fix {
                    let update = session.on_location(&fix);
                    emit(NavigationEvent::PositionChanged(update));
                    if update.arrived_now {
                        info!("[Navigator] Arrived at {:?}", session.destination());
                        emit(NavigationEvent::Arrived);
                    }
                }
            }
            _ = ticker.tick() => {
                let Some(origin) = session.tick() else { continue };

                info!("[Navigator] Off route, recalculating from {:?}", origin);
                emit(NavigationEvent::Recalculating { origin });

                match provider.fetch_route(origin, session.destination()).await {
                    Ok(route) => {
                        session.replace_route(route.clone());
                        emit(NavigationEvent::RouteUpdated(route));
                    }
                    Err(e) => {
                        warn!("[Navigator] Recalculation failed, keeping old route: {}", e);
                        emit(NavigationEvent::RouteUnavailable { message: e.to_string() });
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Pan) => session.pan(),
                    Some(Command::Recenter) => session.recenter(),
                    None => break,
                }
                emit(NavigationEvent::FollowChanged { following: session.following() });
            }
        }
    }
}
