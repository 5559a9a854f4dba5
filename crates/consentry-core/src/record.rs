//! The persisted consent record and its lifecycle rules.

use crate::{CategoryGrants, CategorySelection, ConsentCategory};
use blake3::Hasher;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

fn always_true() -> bool {
    true
}

/// A visitor's recorded consent decision.
///
/// Created on the first decision, overwritten on every subsequent one,
/// deleted on explicit revocation, and treated as absent once older than
/// the configured lifetime. `necessary` is carried in the serialized form
/// for external consumers but is forced to `true` on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    #[serde(skip_deserializing, default = "always_true")]
    pub necessary: bool,
    pub functional: bool,
    pub analytics: bool,
    pub marketing: bool,
    /// Keys of explicitly granted services (for UI labels and opt-in attributes).
    pub granted_services: BTreeSet<String>,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Hash of the policy configuration that was disclosed when deciding.
    pub config_version: String,
}

impl ConsentRecord {
    /// Build a record from a category selection.
    pub fn new(
        selection: CategorySelection,
        granted_services: BTreeSet<String>,
        config_version: &str,
    ) -> Self {
        Self {
            necessary: true,
            functional: selection.functional,
            analytics: selection.analytics,
            marketing: selection.marketing,
            granted_services,
            timestamp: Utc::now(),
            config_version: config_version.to_string(),
        }
    }

    /// Accept-all decision.
    pub fn accept_all(granted_services: BTreeSet<String>, config_version: &str) -> Self {
        Self::new(CategorySelection::accept_all(), granted_services, config_version)
    }

    /// Reject-all decision (necessary only, no services).
    pub fn reject_all(config_version: &str) -> Self {
        Self::new(CategorySelection::reject_all(), BTreeSet::new(), config_version)
    }

    /// Override the decision timestamp (expiry scenarios in tests, imports).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The resolved grant set for this record.
    pub fn grants(&self) -> CategoryGrants {
        CategoryGrants {
            necessary: true,
            functional: self.functional,
            analytics: self.analytics,
            marketing: self.marketing,
        }
    }

    /// Whether a category is granted by this record.
    pub fn granted(&self, category: ConsentCategory) -> bool {
        self.grants().granted(category)
    }

    /// Whether the record is older than `lifetime_days` relative to `now`.
    pub fn is_expired(&self, lifetime_days: u32, now: DateTime<Utc>) -> bool {
        now - self.timestamp > Duration::days(i64::from(lifetime_days))
    }

    /// Stable identifier for this exact decision, used to keep `apply`
    /// idempotent. Two records with identical content and timestamp share
    /// an id.
    pub fn record_id(&self) -> String {
        let mut hasher = Hasher::new();
        hasher.update(&[
            u8::from(self.functional),
            u8::from(self.analytics),
            u8::from(self.marketing),
        ]);
        for key in &self.granted_services {
            hasher.update(key.as_bytes());
            hasher.update(b"\x00");
        }
        hasher.update(&self.timestamp.timestamp_millis().to_le_bytes());
        hasher.update(self.config_version.as_bytes());
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_and_reject_shapes() {
        let accept = ConsentRecord::accept_all(BTreeSet::new(), "h1");
        assert!(accept.necessary && accept.functional && accept.analytics && accept.marketing);

        let reject = ConsentRecord::reject_all("h1");
        assert!(reject.necessary);
        assert!(!reject.functional && !reject.analytics && !reject.marketing);
        assert!(reject.granted(ConsentCategory::Necessary));
    }

    #[test]
    fn expiry_boundary() {
        let now = Utc::now();
        let record = ConsentRecord::reject_all("h1").with_timestamp(now - Duration::days(366));
        assert!(record.is_expired(365, now));

        let fresh = ConsentRecord::reject_all("h1").with_timestamp(now - Duration::days(364));
        assert!(!fresh.is_expired(365, now));
    }

    #[test]
    fn deserialization_forces_necessary_true() {
        let json = r#"{
            "necessary": false,
            "functional": true,
            "analytics": false,
            "marketing": false,
            "granted_services": [],
            "timestamp": "2026-01-01T00:00:00Z",
            "config_version": "h1"
        }"#;
        let record: ConsentRecord = serde_json::from_str(json).unwrap();
        assert!(record.necessary);
        assert!(record.functional);
    }

    #[test]
    fn record_id_is_stable_and_content_sensitive() {
        let record = ConsentRecord::accept_all(BTreeSet::new(), "h1");
        assert_eq!(record.record_id(), record.record_id());

        let mut other = record.clone();
        other.marketing = false;
        assert_ne!(record.record_id(), other.record_id());
    }
}
