//! Shared courier session state.
//!
//! One [`CourierContext`] is built per app session and handed (cloned) to
//! whoever needs it: the device location callback writes fixes into it, the
//! navigator and the live channel observe them. Every field is a
//! `tokio::sync::watch` channel, so readers are notified of changes instead
//! of polling storage, and every write goes through to the
//! [`KeyValueStore`] so the state survives an app restart.

use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::session::LocationFix;
use crate::store::{keys, KeyValueStore, StoreExt};
use crate::{GeoPoint, NavError, Result};

/// A party on either end of a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderParty {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub phone_number: Option<String>,
}

/// The order the courier is currently working on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshot {
    pub id: String,
    pub restaurant: OrderParty,
    pub client: OrderParty,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub picked_up: bool,
    #[serde(default)]
    pub contactless_delivery: bool,
}

struct ContextInner {
    store: Arc<dyn KeyValueStore>,
    last_fix: watch::Sender<Option<LocationFix>>,
    checked_in: watch::Sender<bool>,
    current_order: watch::Sender<Option<OrderSnapshot>>,
    in_transit: watch::Sender<bool>,
}

/// Observable, persisted courier state.
#[derive(Clone)]
pub struct CourierContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for CourierContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierContext")
            .field("last_fix", &self.last_fix())
            .field("checked_in", &self.checked_in())
            .field("in_transit", &self.in_transit())
            .finish()
    }
}

/// Shift status was historically written as the strings "true"/"false".
fn parse_flag(value: Option<Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

impl CourierContext {
    /// Fresh context with nothing recorded.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_state(store, None, false, None, false)
    }

    /// Rebuild the context from whatever the store holds.
    ///
    /// Unreadable entries are logged and treated as absent.
    pub fn restore(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let last_fix = match store.get_as::<GeoPoint>(keys::LAST_LOCATION) {
            Ok(position) => position.map(|p| LocationFix::new(p, None)),
            Err(e) => {
                warn!("[CourierContext] Ignoring stored last location: {}", e);
                None
            }
        };
        let checked_in = parse_flag(store.get(keys::SHIFT_STATUS)?);
        let current_order = match store.get_as::<OrderSnapshot>(keys::CURRENT_ORDER) {
            Ok(order) => order,
            Err(e) => {
                warn!("[CourierContext] Ignoring stored order: {}", e);
                None
            }
        };
        let in_transit = parse_flag(store.get(keys::IN_TRANSIT)?);

        debug!(
            "[CourierContext] Restored: position={}, checked_in={}, order={}, in_transit={}",
            last_fix.is_some(),
            checked_in,
            current_order.is_some(),
            in_transit
        );

        Ok(Self::with_state(
            store,
            last_fix,
            checked_in,
            current_order,
            in_transit,
        ))
    }

    fn with_state(
        store: Arc<dyn KeyValueStore>,
        last_fix: Option<LocationFix>,
        checked_in: bool,
        current_order: Option<OrderSnapshot>,
        in_transit: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                store,
                last_fix: watch::channel(last_fix).0,
                checked_in: watch::channel(checked_in).0,
                current_order: watch::channel(current_order).0,
                in_transit: watch::channel(in_transit).0,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner.store
    }

    // ========================================================================
    // Device position
    // ========================================================================

    /// Record a device fix. This is the only writer of the last known
    /// position; observers see the new value before this returns.
    ///
    /// Fixes with non-finite or out-of-range coordinates are rejected.
    pub fn record_fix(&self, fix: LocationFix) -> Result<()> {
        if !fix.position.is_valid() {
            warn!(
                "[CourierContext] Rejecting invalid fix ({}, {})",
                fix.position.latitude, fix.position.longitude
            );
            return Err(NavError::Internal {
                message: format!(
                    "invalid fix ({}, {})",
                    fix.position.latitude, fix.position.longitude
                ),
            });
        }
        self.inner.last_fix.send_replace(Some(fix));
        self.inner.store.set_as(keys::LAST_LOCATION, &fix.position)
    }

    pub fn last_fix(&self) -> Option<LocationFix> {
        *self.inner.last_fix.borrow()
    }

    pub fn last_position(&self) -> Option<GeoPoint> {
        self.last_fix().map(|fix| fix.position)
    }

    pub fn subscribe_fixes(&self) -> watch::Receiver<Option<LocationFix>> {
        self.inner.last_fix.subscribe()
    }

    // ========================================================================
    // Shift and order state
    // ========================================================================

    pub fn set_checked_in(&self, checked_in: bool) -> Result<()> {
        self.inner.checked_in.send_replace(checked_in);
        self.inner.store.set_as(keys::SHIFT_STATUS, &checked_in)
    }

    pub fn checked_in(&self) -> bool {
        *self.inner.checked_in.borrow()
    }

    pub fn subscribe_checked_in(&self) -> watch::Receiver<bool> {
        self.inner.checked_in.subscribe()
    }

    pub fn set_current_order(&self, order: Option<OrderSnapshot>) -> Result<()> {
        self.inner.current_order.send_replace(order.clone());
        match order {
            Some(order) => self.inner.store.set_as(keys::CURRENT_ORDER, &order),
            None => self.inner.store.remove(keys::CURRENT_ORDER),
        }
    }

    pub fn current_order(&self) -> Option<OrderSnapshot> {
        self.inner.current_order.borrow().clone()
    }

    pub fn subscribe_current_order(&self) -> watch::Receiver<Option<OrderSnapshot>> {
        self.inner.current_order.subscribe()
    }

    pub fn set_in_transit(&self, in_transit: bool) -> Result<()> {
        self.inner.in_transit.send_replace(in_transit);
        self.inner.store.set_as(keys::IN_TRANSIT, &in_transit)
    }

    pub fn in_transit(&self) -> bool {
        *self.inner.in_transit.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sample_order() -> OrderSnapshot {
        OrderSnapshot {
            id: "#A1B2C3".to_string(),
            restaurant: OrderParty {
                name: "Burger Palace".to_string(),
                address: "Alfavej 502, Odense".to_string(),
                phone_number: Some("+45 12 34 56 78".to_string()),
            },
            client: OrderParty {
                name: "John Doe".to_string(),
                address: "456 Park Avenue, Odense".to_string(),
                phone_number: None,
            },
            items: vec!["Double Cheeseburger".to_string()],
            picked_up: false,
            contactless_delivery: true,
        }
    }

    #[test]
    fn test_invalid_fix_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let context = CourierContext::new(store.clone());
        let position = GeoPoint::new(55.3959, 10.3883);
        context.record_fix(LocationFix::new(position, None)).unwrap();
        let mut fixes = context.subscribe_fixes();

        assert!(context
            .record_fix(LocationFix::new(GeoPoint::new(f64::NAN, 10.3883), None))
            .is_err());
        assert!(context
            .record_fix(LocationFix::new(GeoPoint::new(95.0, 10.3883), None))
            .is_err());

        assert!(!fixes.has_changed().unwrap());
        assert_eq!(context.last_position(), Some(position));
        assert_eq!(
            store.get_as::<GeoPoint>(keys::LAST_LOCATION).unwrap(),
            Some(position)
        );
    }

    #[test]
    fn test_record_fix_persists_and_notifies() {
        let store = Arc::new(MemoryStore::new());
        let context = CourierContext::new(store.clone());
        let mut fixes = context.subscribe_fixes();
        assert!(!fixes.has_changed().unwrap());

        let position = GeoPoint::new(55.3959, 10.3883);
        context.record_fix(LocationFix::new(position, Some(90.0))).unwrap();

        assert!(fixes.has_changed().unwrap());
        let seen = *fixes.borrow_and_update();
        assert_eq!(seen.map(|fix| fix.position), Some(position));
        assert_eq!(
            store.get_as::<GeoPoint>(keys::LAST_LOCATION).unwrap(),
            Some(position)
        );
    }

    #[test]
    fn test_restore_roundtrip() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        {
            let context = CourierContext::new(store.clone());
            context
                .record_fix(LocationFix::new(GeoPoint::new(55.0, 10.0), None))
                .unwrap();
            context.set_checked_in(true).unwrap();
            context.set_current_order(Some(sample_order())).unwrap();
            context.set_in_transit(true).unwrap();
        }

        let restored = CourierContext::restore(store).unwrap();
        assert_eq!(restored.last_position(), Some(GeoPoint::new(55.0, 10.0)));
        assert!(restored.checked_in());
        assert_eq!(restored.current_order(), Some(sample_order()));
        assert!(restored.in_transit());
    }

    #[test]
    fn test_restore_legacy_string_flag() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store
            .set(keys::SHIFT_STATUS, Value::String("true".to_string()))
            .unwrap();
        let context = CourierContext::restore(store).unwrap();
        assert!(context.checked_in());
        assert!(context.last_fix().is_none());
    }

    #[test]
    fn test_clearing_order_removes_key() {
        let store = Arc::new(MemoryStore::new());
        let context = CourierContext::new(store.clone());
        context.set_current_order(Some(sample_order())).unwrap();
        context.set_current_order(None).unwrap();
        assert!(store.get(keys::CURRENT_ORDER).unwrap().is_none());
        assert!(context.current_order().is_none());
    }
}
