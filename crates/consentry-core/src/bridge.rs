//! Bridge Adapters
//!
//! Pure, stateless projections of an applied consent record into two
//! external vocabularies: the standardized consent-signal map consumed by
//! ad/analytics platforms, and the generic event-log vocabulary consumed by
//! tag-management tooling. Both are entirely no-op when the corresponding
//! framework was never initialized on the page.

use crate::{ConsentCategory, ConsentRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Grant/deny state for one signal slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalState {
    Granted,
    Denied,
}

impl SignalState {
    fn from_bool(granted: bool) -> Self {
        if granted {
            SignalState::Granted
        } else {
            SignalState::Denied
        }
    }
}

/// The standardized consent-signal vocabulary. Never persisted; recomputed
/// from the record on every apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentSignal {
    pub ad_storage: SignalState,
    pub analytics_storage: SignalState,
    pub ad_user_data: SignalState,
    pub ad_personalization: SignalState,
    pub functionality_storage: SignalState,
    pub personalization_storage: SignalState,
    /// Always granted.
    pub security_storage: SignalState,
}

impl ConsentSignal {
    /// Pure projection of a consent record.
    pub fn from_record(record: &ConsentRecord) -> Self {
        Self {
            ad_storage: SignalState::from_bool(record.marketing),
            analytics_storage: SignalState::from_bool(record.analytics),
            ad_user_data: SignalState::from_bool(record.marketing),
            ad_personalization: SignalState::from_bool(record.marketing),
            functionality_storage: SignalState::from_bool(record.functional),
            personalization_storage: SignalState::from_bool(record.functional),
            security_storage: SignalState::Granted,
        }
    }

    /// The deterministic default announced before any decision: everything
    /// denied except security.
    pub fn default_denied() -> Self {
        Self {
            ad_storage: SignalState::Denied,
            analytics_storage: SignalState::Denied,
            ad_user_data: SignalState::Denied,
            ad_personalization: SignalState::Denied,
            functionality_storage: SignalState::Denied,
            personalization_storage: SignalState::Denied,
            security_storage: SignalState::Granted,
        }
    }
}

/// Receiver for the standardized consent signal (the ad/analytics platform
/// integration installed by the host page).
pub trait SignalSink: Send + Sync {
    /// Announce the pre-decision default together with the grace window
    /// (milliseconds) third-party tags should wait for an update.
    fn announce_default(&self, signal: &ConsentSignal, wait_millis: u32);
    /// Push an updated signal after a decision is applied.
    fn update(&self, signal: &ConsentSignal);
}

/// Adapter for the standardized consent-signal vocabulary.
pub struct ConsentModeBridge {
    sink: Option<Box<dyn SignalSink>>,
    announced: RwLock<bool>,
}

impl ConsentModeBridge {
    pub fn new(sink: Box<dyn SignalSink>) -> Self {
        Self {
            sink: Some(sink),
            announced: RwLock::new(false),
        }
    }

    /// The framework was never initialized on the page: everything no-ops.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            announced: RwLock::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Announce the all-denied-except-security default exactly once, at
    /// page load, before any signal is set. Third-party tags that
    /// initialize immediately see this deterministic default instead of a
    /// race.
    pub fn announce_default(&self, wait_millis: u32) {
        let Some(sink) = &self.sink else { return };
        let mut announced = self.announced.write();
        if *announced {
            return;
        }
        sink.announce_default(&ConsentSignal::default_denied(), wait_millis);
        *announced = true;
    }

    /// Push the signal for an applied record.
    pub fn push(&self, signal: &ConsentSignal) {
        if let Some(sink) = &self.sink {
            sink.update(signal);
        }
    }
}

impl std::fmt::Debug for ConsentModeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentModeBridge")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// One event in the generic event-log vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentEvent {
    pub name: String,
    /// Present on the `consent_updated` event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<crate::CategoryGrants>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

/// Receiver for event-log entries (the tag-management integration).
pub trait EventSink: Send + Sync {
    fn push(&self, event: ConsentEvent);
}

/// Adapter for the generic event-log vocabulary.
pub struct EventLogBridge {
    sink: Option<Box<dyn EventSink>>,
}

impl EventLogBridge {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Emit one `consent_updated` event with the full category map and
    /// granted services, then one `<category>_granted` event per granted
    /// optional category, for simple downstream trigger rules.
    pub fn push_update(&self, record: &ConsentRecord) {
        let Some(sink) = &self.sink else { return };

        sink.push(ConsentEvent {
            name: "consent_updated".into(),
            categories: Some(record.grants()),
            services: record.granted_services.iter().cloned().collect(),
        });

        for category in ConsentCategory::OPTIONAL {
            if record.granted(category) {
                sink.push(ConsentEvent {
                    name: format!("{}_granted", category.as_str()),
                    categories: None,
                    services: Vec::new(),
                });
            }
        }
    }
}

impl std::fmt::Debug for EventLogBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogBridge")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
