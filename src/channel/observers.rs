//! Subscription registry for channel consumers.
//!
//! Consumers register once; the registry outlives any single socket, so a
//! reconnect swaps the transport without anyone re-subscribing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::messages::InboundMessage;
use crate::NavError;

type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;
type CloseHandler = Arc<dyn Fn() + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&NavError) + Send + Sync>;

/// Returned by `on_*`; pass to `unsubscribe` to stop receiving callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Slot<H> {
    handlers: Mutex<Vec<(SubscriptionId, H)>>,
}

impl<H: Clone> Slot<H> {
    fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: SubscriptionId, handler: H) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push((id, handler));
        }
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        match self.handlers.lock() {
            Ok(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(existing, _)| *existing != id);
                handlers.len() != before
            }
            Err(_) => false,
        }
    }

    /// Handlers are cloned out before being called so a handler may
    /// unsubscribe itself.
    fn snapshot(&self) -> Vec<H> {
        self.handlers
            .lock()
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    fn clear(&self) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.clear();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }
}

pub(crate) struct Observers {
    next_id: AtomicU64,
    message: Slot<MessageHandler>,
    close: Slot<CloseHandler>,
    error: Slot<ErrorHandler>,
}

impl Observers {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            message: Slot::new(),
            close: Slot::new(),
            error: Slot::new(),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.message.add(id, Arc::new(handler));
        id
    }

    pub(crate) fn on_close<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.close.add(id, Arc::new(handler));
        id
    }

    pub(crate) fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&NavError) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.error.add(id, Arc::new(handler));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        // Ids are unique across slots, at most one removal succeeds
        self.message.remove(id) | self.close.remove(id) | self.error.remove(id)
    }

    pub(crate) fn clear(&self) {
        self.message.clear();
        self.close.clear();
        self.error.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.message.len() + self.close.len() + self.error.len()
    }

    pub(crate) fn notify_message(&self, message: &InboundMessage) {
        for handler in self.message.snapshot() {
            handler(message);
        }
    }

    pub(crate) fn notify_close(&self) {
        for handler in self.close.snapshot() {
            handler();
        }
    }

    pub(crate) fn notify_error(&self, error: &NavError) {
        for handler in self.error.snapshot() {
            handler(error);
        }
    }
}
