//! SQLite key-value store integration tests.
//!
//! Run with: `cargo test --features persistence --test sqlite_store`

use std::sync::Arc;

use courier_nav::context::{OrderParty, OrderSnapshot};
use courier_nav::session::LocationFix;
use courier_nav::store::{keys, StoreExt};
use courier_nav::{CourierContext, CredentialStore, GeoPoint, KeyValueStore, SqliteStore, TokenPair};
use serde_json::json;
use tempfile::TempDir;

fn open(dir: &TempDir) -> Arc<SqliteStore> {
    let db_path = dir.path().join("courier.db");
    Arc::new(SqliteStore::new(db_path.to_str().unwrap()).expect("failed to open store"))
}

#[test]
fn values_survive_reopen() {
    let dir = TempDir::new().expect("failed to create temp dir");
    {
        let store = open(&dir);
        store
            .set("nested", json!({"a": [1, 2.5, "x"], "b": null, "c": {"d": true}}))
            .unwrap();
        store.set_as(keys::IN_TRANSIT, &true).unwrap();
    }

    let store = open(&dir);
    assert_eq!(
        store.get("nested").unwrap(),
        Some(json!({"a": [1, 2.5, "x"], "b": null, "c": {"d": true}}))
    );
    assert_eq!(store.get_as::<bool>(keys::IN_TRANSIT).unwrap(), Some(true));

    store.remove(keys::IN_TRANSIT).unwrap();
    assert_eq!(store.get(keys::IN_TRANSIT).unwrap(), None);
}

#[test]
fn courier_state_restores_after_restart() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let order = OrderSnapshot {
        id: "#A1B2C3".to_string(),
        restaurant: OrderParty {
            name: "Burger Palace".to_string(),
            address: "Alfavej 502, Odense".to_string(),
            phone_number: None,
        },
        client: OrderParty {
            name: "John Doe".to_string(),
            address: "456 Park Avenue, Odense".to_string(),
            phone_number: Some("+45 12 34 56 78".to_string()),
        },
        items: vec!["Double Cheeseburger".to_string(), "Fries".to_string()],
        picked_up: true,
        contactless_delivery: false,
    };

    {
        let store = open(&dir);
        let context = CourierContext::new(store.clone());
        context
            .record_fix(LocationFix::new(GeoPoint::new(55.3959, 10.3883), Some(45.0)))
            .unwrap();
        context.set_checked_in(true).unwrap();
        context.set_current_order(Some(order.clone())).unwrap();
        CredentialStore::new(store)
            .save(&TokenPair::new("access", "refresh"))
            .unwrap();
    }

    let store = open(&dir);
    let context = CourierContext::restore(store.clone()).unwrap();
    assert_eq!(context.last_position(), Some(GeoPoint::new(55.3959, 10.3883)));
    assert!(context.checked_in());
    assert!(!context.in_transit());
    assert_eq!(context.current_order(), Some(order));
    assert_eq!(
        CredentialStore::new(store).load().unwrap(),
        Some(TokenPair::new("access", "refresh"))
    );
}

#[test]
fn in_memory_database_is_isolated() {
    let first = SqliteStore::in_memory().unwrap();
    let second = SqliteStore::in_memory().unwrap();
    first.set_as(keys::SHIFT_STATUS, &true).unwrap();
    assert_eq!(second.get(keys::SHIFT_STATUS).unwrap(), None);
}
