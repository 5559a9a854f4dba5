//! Consent Broadcast Bus
//!
//! Fan-out of the consent-changed signal to same-page listeners. The signal
//! is dispatched on two listener scopes (window-level and document-level)
//! so both external scripts and in-page components can subscribe, mirroring
//! the dual dispatch of the in-page custom event.

use crate::{CategoryGrants, ConsentRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// The consent-changed notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentChanged {
    pub consent: ConsentRecord,
    pub categories: CategoryGrants,
    pub services: Vec<String>,
}

impl ConsentChanged {
    pub fn from_record(record: &ConsentRecord) -> Self {
        Self {
            consent: record.clone(),
            categories: record.grants(),
            services: record.granted_services.iter().cloned().collect(),
        }
    }
}

/// Which listener scope a subscription targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerScope {
    Window,
    Document,
}

/// Handle for unsubscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Box<dyn Fn(&ConsentChanged) + Send + Sync>;

struct Listener {
    id: ListenerId,
    scope: ListenerScope,
    callback: Callback,
}

/// Same-page fan-out of consent changes.
#[derive(Default)]
pub struct ConsentBus {
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
}

impl ConsentBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener on one scope. Listeners fire in subscription
    /// order within their scope; window scope fires before document scope.
    pub fn subscribe<F>(&self, scope: ListenerScope, callback: F) -> ListenerId
    where
        F: Fn(&ConsentChanged) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Listener {
            id,
            scope,
            callback: Box::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() < before
    }

    /// Deliver a consent change to every listener on both scopes.
    pub fn dispatch(&self, event: &ConsentChanged) {
        let listeners = self.listeners.read();
        for scope in [ListenerScope::Window, ListenerScope::Document] {
            for listener in listeners.iter().filter(|l| l.scope == scope) {
                (listener.callback)(event);
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for ConsentBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn test_event() -> ConsentChanged {
        ConsentChanged::from_record(&ConsentRecord::accept_all(Default::default(), "h1"))
    }

    #[test]
    fn dispatch_reaches_both_scopes_in_order() {
        let bus = ConsentBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        bus.subscribe(ListenerScope::Document, move |_| s1.lock().unwrap().push("doc"));
        let s2 = seen.clone();
        bus.subscribe(ListenerScope::Window, move |_| s2.lock().unwrap().push("win"));

        bus.dispatch(&test_event());
        assert_eq!(*seen.lock().unwrap(), vec!["win", "doc"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = ConsentBus::new();
        let seen = Arc::new(Mutex::new(0u32));

        let s = seen.clone();
        let id = bus.subscribe(ListenerScope::Window, move |_| *s.lock().unwrap() += 1);

        bus.dispatch(&test_event());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.dispatch(&test_event());

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn payload_carries_categories_and_services() {
        let mut services = std::collections::BTreeSet::new();
        services.insert("ga4".to_string());
        let record = ConsentRecord::accept_all(services, "h1");

        let event = ConsentChanged::from_record(&record);
        assert!(event.categories.analytics);
        assert_eq!(event.services, vec!["ga4".to_string()]);
    }
}
