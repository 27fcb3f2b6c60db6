//! Supervising connection manager.
//!
//! One supervisor task per `connect` owns the socket. It loops over
//! connect, serve and back off until `disconnect` aborts it. The periodic
//! broadcast lives inside `serve` and the backoff sleep after it, so the two
//! timers can never run for the same socket.
//!
//! Abort only lands at the task's next `.await`, so each supervisor carries
//! the generation it was started with. Anything it publishes (state, socket)
//! goes through [`ConnectionManager::while_current`], which refuses once
//! `disconnect` or a newer `connect` has bumped the generation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::messages::{DeliveryId, DeliveryStatus, InboundMessage, OutboundMessage};
use super::observers::{Observers, SubscriptionId};
use super::{ChannelConfig, ChannelState, Connection, Connector, Endpoint, TransportEvent};
use crate::auth::{CredentialStore, RefreshMode, TokenRefresher};
use crate::context::CourierContext;
use crate::{GeoPoint, NavError, Result};

/// Lock that shrugs off poisoning; the guarded values stay consistent
/// because every critical section is a single assignment.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum SessionEnd {
    Closed,
    Failed(NavError),
}

/// The running supervisor task and the generation it belongs to.
#[derive(Default)]
struct Supervisor {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

enum Next {
    Reconnect(Duration),
    Stop,
}

struct ManagerInner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    context: CourierContext,
    credentials: CredentialStore,
    refresher: Arc<dyn TokenRefresher>,
    state: watch::Sender<ChannelState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Last position handed to `send_location_update`, with its time in ms.
    last_sent: Mutex<Option<(GeoPoint, i64)>>,
    supervisor: Mutex<Supervisor>,
    observers: Observers,
}

/// Owner of the live channel. Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("base_url", &self.inner.config.base_url)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        context: CourierContext,
        credentials: CredentialStore,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                connector,
                context,
                credentials,
                refresher,
                state: watch::channel(ChannelState::Closed).0,
                outbound: Mutex::new(None),
                last_sent: Mutex::new(None),
                supervisor: Mutex::new(Supervisor::default()),
                observers: Observers::new(),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!("[ConnectionManager] {:?} -> {:?}", previous, state);
        }
    }

    /// Run `f` while holding the supervisor lock, but only if `generation`
    /// is still the live one. `None` means the caller has been superseded.
    fn while_current<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let supervisor = lock(&self.inner.supervisor);
        if supervisor.generation != generation {
            debug!(
                "[ConnectionManager] Supervisor {} superseded by {}",
                generation, supervisor.generation
            );
            return None;
        }
        Some(f())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the channel to `endpoint`. No-op while a connection is open or
    /// being (re)established. Must be called from within a tokio runtime.
    ///
    /// Fails with [`NavError::Auth`] when no access token is stored.
    pub fn connect(&self, endpoint: Endpoint) -> Result<()> {
        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor.task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("[ConnectionManager] Already connected, ignoring connect");
            return Ok(());
        }

        if self.inner.credentials.access_token()?.is_none() {
            warn!("[ConnectionManager] No access token found, cannot connect");
            return Err(NavError::auth("no access token stored"));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| NavError::Internal {
            message: format!("connect needs a tokio runtime: {}", e),
        })?;

        supervisor.generation += 1;
        let generation = supervisor.generation;
        self.set_state(ChannelState::Connecting);
        let manager = self.clone();
        supervisor.task =
            Some(runtime.spawn(async move { manager.supervise(endpoint, generation).await }));
        Ok(())
    }

    /// Close the channel and cancel pending reconnects and broadcasts. The
    /// channel stays closed until `connect` is called again.
    pub fn disconnect(&self) {
        let mut supervisor = lock(&self.inner.supervisor);
        supervisor.generation += 1;
        if let Some(task) = supervisor.task.take() {
            task.abort();
        }
        lock(&self.inner.outbound).take();
        self.set_state(ChannelState::Closed);
        drop(supervisor);
        info!("[ConnectionManager] Disconnected");
    }

    /// Disconnect and drop every subscription.
    pub fn teardown(&self) {
        self.disconnect();
        self.inner.observers.clear();
    }

    async fn supervise(self, endpoint: Endpoint, generation: u64) {
        let url = endpoint.url(&self.inner.config.base_url);
        let reconnect_delay = Duration::from_millis(self.inner.config.reconnect_delay_ms);

        loop {
            if self
                .while_current(generation, || self.set_state(ChannelState::Connecting))
                .is_none()
            {
                return;
            }
            info!("[ConnectionManager] Connecting to {}", url);

            let end = match self.inner.credentials.access_token() {
                Ok(Some(token)) => match self.inner.connector.connect(&url).await {
                    Ok(connection) => self.serve(connection, token, generation).await,
                    Err(e) => SessionEnd::Failed(e),
                },
                Ok(None) => SessionEnd::Failed(NavError::auth("no access token stored")),
                Err(e) => SessionEnd::Failed(e),
            };

            let still_current = self.while_current(generation, || {
                lock(&self.inner.outbound).take();
                self.set_state(ChannelState::Closed);
            });
            if still_current.is_none() {
                return;
            }

            let next = match end {
                SessionEnd::Closed => {
                    info!("[ConnectionManager] Connection closed");
                    Next::Reconnect(reconnect_delay)
                }
                SessionEnd::Failed(e) => self.recover(e).await,
            };
            self.inner.observers.notify_close();

            match next {
                Next::Reconnect(delay) => {
                    if self
                        .while_current(generation, || self.set_state(ChannelState::Reconnecting))
                        .is_none()
                    {
                        return;
                    }
                    debug!("[ConnectionManager] Reconnecting in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                Next::Stop => {
                    warn!("[ConnectionManager] No usable credentials, staying closed");
                    return;
                }
            }
        }
    }

    /// A failed socket is treated as an expired token: force a refresh and
    /// pick the next step from its outcome.
    async fn recover(&self, error: NavError) -> Next {
        warn!("[ConnectionManager] Channel error: {}", error);
        self.inner.observers.notify_error(&error);

        let refreshed = self
            .inner
            .credentials
            .refresh_with(self.inner.refresher.as_ref(), RefreshMode::Forced)
            .await;

        match refreshed {
            Ok(_) => Next::Reconnect(Duration::from_millis(self.inner.config.auth_retry_delay_ms)),
            Err(e) if e.is_transient() => {
                warn!("[ConnectionManager] Credential refresh failed: {}", e);
                self.inner.observers.notify_error(&e);
                Next::Reconnect(Duration::from_millis(self.inner.config.reconnect_delay_ms))
            }
            Err(e) => {
                // Rejected or unusable credentials; retrying cannot help
                self.inner.observers.notify_error(&e);
                Next::Stop
            }
        }
    }

    async fn serve(&self, connection: Connection, token: String, generation: u64) -> SessionEnd {
        let Connection {
            outbound,
            mut inbound,
        } = connection;

        // Handshake and publish in one critical section, so a concurrent
        // `disconnect` sees either nothing or a fully open socket to close
        let opened = self.while_current(generation, || {
            if !self.send_raw(&outbound, &OutboundMessage::authorization(token)) {
                return false;
            }
            if let Some(position) = self.last_known_position() {
                self.send_raw(&outbound, &OutboundMessage::location_update(position));
                debug!("[ConnectionManager] Sent initial location_update");
            }
            *lock(&self.inner.outbound) = Some(outbound.clone());
            self.set_state(ChannelState::Open);
            true
        });
        match opened {
            Some(true) => info!("[ConnectionManager] Open"),
            Some(false) | None => return SessionEnd::Closed,
        }

        let period = Duration::from_millis(self.inner.config.broadcast_interval_ms.max(1));
        let mut broadcast = interval_at(Instant::now() + period, period);
        broadcast.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut checked_in = self.inner.context.subscribe_checked_in();
        let mut watching_checked_in = true;

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(TransportEvent::Message(text)) => self.handle_inbound(&outbound, &text).await,
                    Some(TransportEvent::Error(message)) => {
                        return SessionEnd::Failed(NavError::Http { message, status_code: None });
                    }
                    Some(TransportEvent::Closed) | None => return SessionEnd::Closed,
                },
                _ = broadcast.tick() => {
                    if self.inner.context.checked_in() {
                        if let Some(position) = self.last_known_position() {
                            self.send_raw(&outbound, &OutboundMessage::location_update(position));
                        }
                    }
                }
                changed = checked_in.changed(), if watching_checked_in => {
                    if changed.is_err() {
                        watching_checked_in = false;
                    } else if *checked_in.borrow_and_update() {
                        self.send_raw(&outbound, &OutboundMessage::checked_in());
                    }
                }
            }
        }
    }

    async fn handle_inbound(&self, outbound: &mpsc::UnboundedSender<String>, text: &str) {
        // Refresh ahead of processing so the exchange does not race an
        // expiring token
        match self
            .inner
            .credentials
            .refresh_with(self.inner.refresher.as_ref(), RefreshMode::Opportunistic)
            .await
        {
            Ok(Some(_)) => debug!("[ConnectionManager] Tokens refreshed before inbound message"),
            Ok(None) => {}
            Err(e) => warn!("[ConnectionManager] Opportunistic refresh failed: {}", e),
        }

        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[ConnectionManager] Dropping malformed message: {}", e);
                return;
            }
        };
        debug!("[ConnectionManager] <- {}", message.kind);

        if message.is_location_request() {
            let request_id = message.request_id();
            let reply = match self.last_known_position() {
                Some(position) => OutboundMessage::location_response(position, request_id),
                None => OutboundMessage::location_unavailable(request_id),
            };
            self.send_raw(outbound, &reply);
        } else {
            self.inner.observers.notify_message(&message);
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn send_raw(&self, outbound: &mpsc::UnboundedSender<String>, message: &OutboundMessage) -> bool {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("[ConnectionManager] Could not encode {}: {}", message.kind(), e);
                return false;
            }
        };
        debug!("[ConnectionManager] -> {}", message.kind());
        outbound.send(json).is_ok()
    }

    /// Send on the open socket, or drop with a warning. Never blocks.
    fn send_if_open(&self, message: &OutboundMessage) -> bool {
        if self.state() != ChannelState::Open {
            warn!(
                "[ConnectionManager] Not open, dropping {}",
                message.kind()
            );
            return false;
        }
        let outbound = lock(&self.inner.outbound).clone();
        match outbound {
            Some(outbound) => self.send_raw(&outbound, message),
            None => {
                warn!("[ConnectionManager] No socket, dropping {}", message.kind());
                false
            }
        }
    }

    pub fn send_status_update(
        &self,
        delivery_id: impl Into<DeliveryId>,
        status: DeliveryStatus,
    ) -> bool {
        self.send_if_open(&OutboundMessage::status_update(delivery_id.into(), status))
    }

    /// Remember `position` as the channel's latest, then send it if open.
    pub fn send_location_update(&self, position: GeoPoint) -> bool {
        *lock(&self.inner.last_sent) = Some((position, chrono::Utc::now().timestamp_millis()));
        self.send_if_open(&OutboundMessage::location_update(position))
    }

    pub fn send_checked_in(&self) -> bool {
        self.send_if_open(&OutboundMessage::checked_in())
    }

    /// The newer of the recorded device fix and the last position sent.
    pub fn last_known_position(&self) -> Option<GeoPoint> {
        let sent = *lock(&self.inner.last_sent);
        let recorded = self
            .inner
            .context
            .last_fix()
            .map(|fix| (fix.position, fix.timestamp_ms));

        match (sent, recorded) {
            (Some(sent), Some(recorded)) if sent.1 > recorded.1 => Some(sent.0),
            (_, Some(recorded)) => Some(recorded.0),
            (sent, None) => sent.map(|(position, _)| position),
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Called for every inbound message except location requests, which
    /// the channel answers itself.
    pub fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.inner.observers.on_message(handler)
    }

    pub fn on_close<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.observers.on_close(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&NavError) + Send + Sync + 'static,
    {
        self.inner.observers.on_error(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenPair;
    use crate::session::LocationFix;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct NoRefresh;

    #[async_trait]
    impl TokenRefresher for NoRefresh {
        async fn refresh(&self, _: &TokenPair, _: RefreshMode) -> Result<Option<TokenPair>> {
            Ok(None)
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, url: &str) -> Result<Connection> {
            Err(NavError::Http {
                message: format!("{} unreachable", url),
                status_code: None,
            })
        }
    }

    /// Forced refreshes fail with the given error.
    struct FailingRefresh(NavError);

    #[async_trait]
    impl TokenRefresher for FailingRefresh {
        async fn refresh(&self, _: &TokenPair, mode: RefreshMode) -> Result<Option<TokenPair>> {
            match mode {
                RefreshMode::Opportunistic => Ok(None),
                RefreshMode::Forced => Err(self.0.clone()),
            }
        }
    }

    type ServerHalf = (
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<TransportEvent>,
    );

    /// Handshake that finishes inside a single poll, after blocking work.
    #[derive(Default)]
    struct BlockingHandshake {
        servers: Mutex<Vec<ServerHalf>>,
    }

    #[async_trait]
    impl Connector for BlockingHandshake {
        async fn connect(&self, _url: &str) -> Result<Connection> {
            std::thread::sleep(Duration::from_millis(100));
            let (outbound, received) = mpsc::unbounded_channel();
            let (push, inbound) = mpsc::unbounded_channel();
            self.servers.lock().unwrap().push((received, push));
            Ok(Connection { outbound, inbound })
        }
    }

    fn manager_with(
        with_token: bool,
        connector: Arc<dyn Connector>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> (ConnectionManager, CourierContext) {
        let store = Arc::new(MemoryStore::new());
        let context = CourierContext::new(store.clone());
        let credentials = CredentialStore::new(store);
        if with_token {
            credentials.save(&TokenPair::new("access", "refresh")).unwrap();
        }
        let manager = ConnectionManager::new(
            ChannelConfig::default(),
            connector,
            context.clone(),
            credentials,
            refresher,
        );
        (manager, context)
    }

    fn manager(with_token: bool) -> (ConnectionManager, CourierContext) {
        manager_with(with_token, Arc::new(Unreachable), Arc::new(NoRefresh))
    }

    fn collect_errors(manager: &ConnectionManager) -> Arc<Mutex<Vec<String>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        manager.on_error(move |e| sink.lock().unwrap().push(e.to_string()));
        errors
    }

    #[tokio::test]
    async fn test_connect_without_token_fails() {
        let (manager, _) = manager(false);
        let err = manager.connect(Endpoint::Delivery).unwrap_err();
        assert!(err.is_auth());
        assert_eq!(manager.state(), ChannelState::Closed);
    }

    #[test]
    fn test_sends_while_closed_are_dropped() {
        let (manager, _) = manager(true);
        assert!(!manager.send_location_update(GeoPoint::new(55.4, 10.39)));
        assert!(!manager.send_status_update(7i64, DeliveryStatus::Delivered));
        assert!(!manager.send_checked_in());
        // The position is still remembered for the next open
        assert_eq!(
            manager.last_known_position(),
            Some(GeoPoint::new(55.4, 10.39))
        );
    }

    #[test]
    fn test_last_known_position_prefers_newest() {
        let (manager, context) = manager(true);
        assert_eq!(manager.last_known_position(), None);

        let mut fix = LocationFix::new(GeoPoint::new(55.0, 10.0), None);
        fix.timestamp_ms = 1_000;
        context.record_fix(fix).unwrap();
        assert_eq!(manager.last_known_position(), Some(GeoPoint::new(55.0, 10.0)));

        // Sent now, so newer than the fix stamped at 1s past the epoch
        manager.send_location_update(GeoPoint::new(55.1, 10.1));
        assert_eq!(manager.last_known_position(), Some(GeoPoint::new(55.1, 10.1)));

        context
            .record_fix(LocationFix::new(GeoPoint::new(55.2, 10.2), None))
            .unwrap();
        assert_eq!(manager.last_known_position(), Some(GeoPoint::new(55.2, 10.2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backend_keeps_retrying() {
        let (manager, _) = manager(true);
        let errors = collect_errors(&manager);

        manager.connect(Endpoint::Delivery).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        // Refresh "succeeded" (no new tokens), so retries use the short delay
        assert!(errors.lock().unwrap().len() >= 2);
        assert_ne!(manager.state(), ChannelState::Open);

        manager.disconnect();
        assert_eq!(manager.state(), ChannelState::Closed);
        let seen = errors.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(errors.lock().unwrap().len(), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_refresh_failure_uses_normal_backoff() {
        let refresher = FailingRefresh(NavError::Http {
            message: "Service Unavailable".to_string(),
            status_code: Some(503),
        });
        let (manager, _) = manager_with(true, Arc::new(Unreachable), Arc::new(refresher));
        let errors = collect_errors(&manager);

        manager.connect(Endpoint::Delivery).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        // Socket error and refresh error, then waiting out the 3s delay
        assert_eq!(errors.lock().unwrap().len(), 2);
        assert_eq!(manager.state(), ChannelState::Reconnecting);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(errors.lock().unwrap().len(), 4);
        manager.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_refresh_response_stays_closed() {
        let refresher = FailingRefresh(NavError::Http {
            message: "Bad Request".to_string(),
            status_code: Some(400),
        });
        let (manager, _) = manager_with(true, Arc::new(Unreachable), Arc::new(refresher));
        let errors = collect_errors(&manager);

        manager.connect(Endpoint::Delivery).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(errors.lock().unwrap().len(), 2);
        assert_eq!(manager.state(), ChannelState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_during_handshake_stays_closed() {
        let connector = Arc::new(BlockingHandshake::default());
        let (manager, _) = manager_with(true, connector.clone(), Arc::new(NoRefresh));

        manager.connect(Endpoint::Delivery).unwrap();
        // Land inside the blocking handshake, where abort cannot interrupt
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.disconnect();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(manager.state(), ChannelState::Closed);
        assert!(!manager.send_location_update(GeoPoint::new(55.4, 10.39)));
        assert!(!manager.send_status_update(7i64, DeliveryStatus::Delivered));

        // The superseded handshake never wrote to the socket
        for (received, _) in connector.servers.lock().unwrap().iter_mut() {
            assert!(received.try_recv().is_err());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconnect_after_disconnect_opens_new_socket() {
        let connector = Arc::new(BlockingHandshake::default());
        let (manager, _) = manager_with(true, connector.clone(), Arc::new(NoRefresh));

        manager.connect(Endpoint::Delivery).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.disconnect();
        manager.connect(Endpoint::Delivery).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(manager.state(), ChannelState::Open);
        assert!(manager.send_checked_in());
        manager.disconnect();
        assert_eq!(manager.state(), ChannelState::Closed);
    }
}
