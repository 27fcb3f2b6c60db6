//! # Live Position Channel
//!
//! A self-healing duplex connection to the backend used for location
//! broadcasts, delivery status updates and order-assignment pushes.
//!
//! ## States
//! `Closed -> Connecting -> Open -> Closed`, with `Reconnecting` while the
//! backoff delay runs. Once connected, the channel keeps reconnecting every
//! 3 seconds after a drop until [`ConnectionManager::disconnect`] is called.
//!
//! The transport sits behind [`Connector`] so the state machine runs
//! unchanged over a real WebSocket (feature `http`) or an in-memory pair in
//! tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;

mod manager;
pub mod messages;
mod observers;
#[cfg(feature = "http")]
mod transport;

pub use manager::ConnectionManager;
pub use messages::{Delivery, DeliveryId, DeliveryStatus, InboundMessage, OutboundMessage};
pub use observers::SubscriptionId;
#[cfg(feature = "http")]
pub use transport::WebSocketConnector;

/// Connection lifecycle as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    /// Waiting out the backoff before the next connection attempt.
    Reconnecting,
}

/// Which live endpoint to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Courier delivery feed: assignments, location requests.
    Delivery,
    /// A chat conversation.
    Chat(String),
}

impl Endpoint {
    pub fn path(&self) -> String {
        match self {
            Endpoint::Delivery => "/ws/courier/delivery".to_string(),
            Endpoint::Chat(chat_id) => format!("/ws/chat/{}", chat_id),
        }
    }

    /// Full socket URL for `base_url` (`http` becomes `ws`, `https` becomes `wss`).
    pub fn url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}{}", base, self.path())
    }
}

/// Live channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Backend root, e.g. `https://api.example.com`
    pub base_url: String,
    /// Delay before reconnecting after a drop.
    /// Default: 3000 ms
    pub reconnect_delay_ms: u64,
    /// Delay before reconnecting after a successful credential refresh.
    /// Default: 1000 ms
    pub auth_retry_delay_ms: u64,
    /// Location broadcast period while checked in.
    /// Default: 30000 ms
    pub broadcast_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            reconnect_delay_ms: 3000,
            auth_retry_delay_ms: 1000,
            broadcast_interval_ms: 30_000,
        }
    }
}

/// What the transport reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A text frame.
    Message(String),
    /// The socket failed; a `Closed` may or may not follow.
    Error(String),
    Closed,
}

/// One established connection. Dropping `outbound` closes the socket.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection>;
}
