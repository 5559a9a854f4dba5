//! Consent Store
//!
//! Reads and writes the persisted consent record (plus the handful of
//! sibling keys the governance layer owns) through an origin-scoped
//! key-value backend. Corrupted values are treated as absent, never as
//! errors; a backend that stops accepting writes degrades the store to
//! memory-only for the rest of the page life.

use crate::{ConsentError, ConsentRecord, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Well-known storage keys, all owned by the governance layer.
pub mod keys {
    /// The serialized consent record.
    pub const CONSENT: &str = "consentry_consent";
    /// Decision timestamp (RFC 3339), kept alongside the record.
    pub const CONSENT_AT: &str = "consentry_consent_at";
    /// Stable anonymous visitor identifier.
    pub const VISITOR_ID: &str = "consentry_visitor";
    /// Age-verification flag.
    pub const AGE_VERIFIED: &str = "consentry_age_verified";
    /// Age-verification timestamp (RFC 3339).
    pub const AGE_VERIFIED_AT: &str = "consentry_age_verified_at";
    /// Active A/B-variant policy config hash.
    pub const VARIANT_HASH: &str = "consentry_variant";
    /// Revocation marker (RFC 3339 of the last explicit revocation).
    pub const REVOKED_AT: &str = "consentry_revoked_at";
}

/// An origin-scoped persistent key-value store.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory backend (tests, degraded mode).
#[derive(Debug, Default)]
pub struct MemoryStorage {
    map: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.map.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }
}

/// File-backed backend: one file per key under an explicit base directory,
/// written atomically (temp file, best-effort sync, rename).
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.path_for(key)).ok()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp_path = self.dir.join(format!("{key}.tmp"));
        let final_path = self.path_for(key);

        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(value.as_bytes())?;
        f.flush()?;

        #[cfg(unix)]
        {
            let _ = f.sync_all();
            if let Ok(dir_fd) = fs::File::open(&self.dir) {
                let _ = dir_fd.sync_all();
            }
        }

        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Outcome of reading the persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredConsent {
    /// No record, or an unparsable one.
    Missing,
    /// A record exists but is older than the configured lifetime.
    Expired,
    /// A valid, unexpired record.
    Valid(ConsentRecord),
}

/// The single durable shared resource of the page: the consent record and
/// its sibling keys. Single-writer-per-decision (only the state machine
/// writes the record); safe for any number of readers.
pub struct ConsentStore {
    backend: Box<dyn StorageBackend>,
    /// Freshest values once the backend has failed a write.
    overlay: MemoryStorage,
    degraded: RwLock<bool>,
}

impl ConsentStore {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            overlay: MemoryStorage::new(),
            degraded: RwLock::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::new()))
    }

    /// Whether the store has fallen back to memory-only persistence.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.read()
    }

    fn read_key(&self, key: &str) -> Option<String> {
        if *self.degraded.read() {
            if let Some(value) = self.overlay.get(key) {
                return Some(value);
            }
        }
        self.backend.get(key)
    }

    /// Write through to the backend; on failure, degrade to the memory
    /// overlay so consent is still honored for this page life.
    fn write_key(&self, key: &str, value: &str) {
        // Keep the overlay current so reads stay consistent after a later
        // backend failure.
        let _ = self.overlay.put(key, value);
        if let Err(err) = self.backend.put(key, value) {
            if !*self.degraded.read() {
                warn!(key, %err, "consent storage unavailable, degrading to memory-only");
            }
            *self.degraded.write() = true;
        }
    }

    fn remove_key(&self, key: &str) {
        let _ = self.overlay.remove(key);
        if let Err(err) = self.backend.remove(key) {
            if !*self.degraded.read() {
                warn!(key, %err, "consent storage unavailable, degrading to memory-only");
            }
            *self.degraded.write() = true;
        }
    }

    /// Read the persisted record, distinguishing missing from expired.
    /// Unparsable records are `Missing`, never an error.
    pub fn load_state(&self, lifetime_days: u32) -> StoredConsent {
        let raw = match self.read_key(keys::CONSENT) {
            Some(raw) => raw,
            None => return StoredConsent::Missing,
        };
        let record: ConsentRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                debug!(%err, "discarding unparsable consent record");
                return StoredConsent::Missing;
            }
        };

        // The sibling timestamp key is authoritative when present and valid.
        let decided_at = self
            .read_key(keys::CONSENT_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(record.timestamp);

        if Utc::now() - decided_at > Duration::days(i64::from(lifetime_days)) {
            return StoredConsent::Expired;
        }
        StoredConsent::Valid(record)
    }

    /// Read the persisted record, treating expired identically to missing.
    pub fn load(&self, lifetime_days: u32) -> Option<ConsentRecord> {
        match self.load_state(lifetime_days) {
            StoredConsent::Valid(record) => Some(record),
            StoredConsent::Missing | StoredConsent::Expired => None,
        }
    }

    /// Replace the persisted record and its timestamp. Broadcasting is the
    /// caller's responsibility.
    pub fn save(&self, record: &ConsentRecord) {
        match serde_json::to_string(record) {
            Ok(raw) => {
                self.write_key(keys::CONSENT, &raw);
                self.write_key(keys::CONSENT_AT, &record.timestamp.to_rfc3339());
            }
            Err(err) => warn!(%err, "failed to serialize consent record"),
        }
    }

    /// Remove the persisted record (explicit revocation, reconsent).
    pub fn clear(&self) {
        self.remove_key(keys::CONSENT);
        self.remove_key(keys::CONSENT_AT);
    }

    /// Stable anonymous visitor identifier, created on first read.
    pub fn visitor_id(&self) -> String {
        if let Some(id) = self.read_key(keys::VISITOR_ID) {
            return id;
        }
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        self.write_key(keys::VISITOR_ID, &id);
        id
    }

    /// Record an explicit revocation (audit marker; the record itself is
    /// removed via `clear`).
    pub fn mark_revoked(&self) {
        self.write_key(keys::REVOKED_AT, &Utc::now().to_rfc3339());
    }

    /// When the visitor last explicitly revoked, if ever.
    pub fn revoked_at(&self) -> Option<DateTime<Utc>> {
        self.read_key(keys::REVOKED_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Store the age-verification flag with its own timestamp.
    pub fn set_age_verified(&self, verified: bool) {
        self.write_key(keys::AGE_VERIFIED, if verified { "1" } else { "0" });
        self.write_key(keys::AGE_VERIFIED_AT, &Utc::now().to_rfc3339());
    }

    /// Age-verification flag, honoring its own lifetime.
    pub fn age_verified(&self, lifetime_days: u32) -> Option<bool> {
        let flag = self.read_key(keys::AGE_VERIFIED)?;
        let at = self
            .read_key(keys::AGE_VERIFIED_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc))?;
        if Utc::now() - at > Duration::days(i64::from(lifetime_days)) {
            return None;
        }
        Some(flag == "1")
    }

    /// The A/B-variant policy config hash assigned to this visitor.
    pub fn variant_hash(&self) -> Option<String> {
        self.read_key(keys::VARIANT_HASH)
    }

    pub fn set_variant_hash(&self, hash: &str) {
        self.write_key(keys::VARIANT_HASH, hash);
    }
}

impl std::fmt::Debug for ConsentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentStore")
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

/// A backend that refuses writes; exists so degradation paths stay testable.
#[derive(Debug, Default)]
pub struct UnavailableStorage;

impl StorageBackend for UnavailableStorage {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn put(&self, _key: &str, _value: &str) -> Result<()> {
        Err(ConsentError::Storage("storage disabled".into()))
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Err(ConsentError::Storage("storage disabled".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn roundtrip_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConsentStore::new(Box::new(FileStorage::new(dir.path())));

        assert_eq!(store.load_state(365), StoredConsent::Missing);

        let record = ConsentRecord::accept_all(Default::default(), "h1");
        store.save(&record);
        assert_eq!(store.load(365), Some(record));
        assert!(!store.is_degraded());

        store.clear();
        assert_eq!(store.load_state(365), StoredConsent::Missing);
    }

    #[test]
    fn corrupted_record_is_missing() {
        let store = ConsentStore::in_memory();
        store.write_key(keys::CONSENT, "{not json");
        assert_eq!(store.load_state(365), StoredConsent::Missing);
    }

    #[test]
    fn expired_record_is_reported() {
        let store = ConsentStore::in_memory();
        let record = ConsentRecord::reject_all("h1")
            .with_timestamp(Utc::now() - Duration::days(366));
        store.save(&record);

        assert_eq!(store.load_state(365), StoredConsent::Expired);
        assert_eq!(store.load(365), None);
        // A longer lifetime keeps it valid.
        assert!(matches!(store.load_state(400), StoredConsent::Valid(_)));
    }

    #[test]
    fn degrades_to_memory_on_write_failure() {
        let store = ConsentStore::new(Box::new(UnavailableStorage));
        let record = ConsentRecord::accept_all(Default::default(), "h1");
        store.save(&record);

        assert!(store.is_degraded());
        // Consent is still honored for this page life.
        assert_eq!(store.load(365), Some(record));
    }

    #[test]
    fn visitor_id_is_stable() {
        let store = ConsentStore::in_memory();
        let id = store.visitor_id();
        assert_eq!(id.len(), 32);
        assert_eq!(store.visitor_id(), id);
    }

    #[test]
    fn age_verification_has_own_expiry() {
        let store = ConsentStore::in_memory();
        assert_eq!(store.age_verified(30), None);

        store.set_age_verified(true);
        assert_eq!(store.age_verified(30), Some(true));

        // Backdate the timestamp past the lifetime.
        store.write_key(
            keys::AGE_VERIFIED_AT,
            &(Utc::now() - Duration::days(31)).to_rfc3339(),
        );
        assert_eq!(store.age_verified(30), None);
    }

    #[test]
    fn revocation_marker() {
        let store = ConsentStore::in_memory();
        assert!(store.revoked_at().is_none());
        store.mark_revoked();
        assert!(store.revoked_at().is_some());
    }
}
