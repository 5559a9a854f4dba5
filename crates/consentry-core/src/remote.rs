//! Remote collaborators
//!
//! The network endpoints the governance layer consumes are external
//! collaborators, modeled as traits with built-in fallbacks. Every failure
//! degrades to a default and proceeds; the decision flow never stalls or
//! fails on a remote call.

use crate::{ConsentRecord, Result, ServiceDescriptor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Site configuration fetched at load (or baked in). Presentation concerns
/// (colors, texts, layout) live outside the core; only the policy inputs
/// are modeled here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Days a consent decision stays valid.
    pub lifetime_days: u32,
    /// Honor the visitor's do-not-track preference with an implicit
    /// reject-all.
    pub honor_do_not_track: bool,
    /// Whether the site restricts consent soliciting by region.
    pub geo_restricted: bool,
    /// Services the site declares, per category.
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
    /// A/B-test variant identifier for the active policy configuration.
    #[serde(default)]
    pub variant_hash: Option<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            lifetime_days: 365,
            honor_do_not_track: true,
            geo_restricted: false,
            services: Vec::new(),
            variant_hash: None,
        }
    }
}

/// Fetch of the site configuration.
pub trait ConfigSource: Send + Sync {
    fn fetch_site_config(&self) -> Result<SiteConfig>;
}

/// Geo-restriction lookup: is the visitor in a region where consent is
/// solicited?
pub trait GeoLookup: Send + Sync {
    fn visitor_in_scope(&self) -> Result<bool>;
}

/// Server-side audit logging of consent decisions. Fire-and-forget.
pub trait ConsentLogSink: Send + Sync {
    fn log_decision(&self, record: &ConsentRecord, visitor_id: &str) -> Result<()>;
}

/// Per-site reconsent-required flag keyed by config hash.
pub trait ReconsentFlagSource: Send + Sync {
    fn reconsent_required(&self, config_hash: &str) -> Result<bool>;
}

/// A config source with a fixed answer (embedded configuration, tests).
#[derive(Debug, Clone)]
pub struct StaticConfigSource(pub SiteConfig);

impl ConfigSource for StaticConfigSource {
    fn fetch_site_config(&self) -> Result<SiteConfig> {
        Ok(self.0.clone())
    }
}

/// Default geo lookup: everyone is in scope, so consent is solicited.
/// Soliciting keeps everything blocked until a decision, which is the
/// fail-safe direction.
#[derive(Debug, Default)]
pub struct NullGeoLookup;

impl GeoLookup for NullGeoLookup {
    fn visitor_in_scope(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Default audit sink: drop decisions.
#[derive(Debug, Default)]
pub struct NullLogSink;

impl ConsentLogSink for NullLogSink {
    fn log_decision(&self, _record: &ConsentRecord, _visitor_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Default reconsent flag: never force reconsent.
#[derive(Debug, Default)]
pub struct NullReconsentFlag;

impl ReconsentFlagSource for NullReconsentFlag {
    fn reconsent_required(&self, _config_hash: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Fetch the site configuration, falling back to `fallback` on any failure.
pub fn load_site_config(source: &dyn ConfigSource, fallback: &SiteConfig) -> SiteConfig {
    match source.fetch_site_config() {
        Ok(config) => config,
        Err(err) => {
            warn!(%err, "site config fetch failed, using fallback configuration");
            fallback.clone()
        }
    }
}

/// Resolve the geo check with its fail-safe default.
pub fn resolve_geo(geo: &dyn GeoLookup) -> bool {
    match geo.visitor_in_scope() {
        Ok(in_scope) => in_scope,
        Err(err) => {
            warn!(%err, "geo lookup failed, soliciting consent");
            true
        }
    }
}

/// Resolve the reconsent flag with its fail-safe default.
pub fn resolve_reconsent_flag(source: &dyn ReconsentFlagSource, config_hash: &str) -> bool {
    match source.reconsent_required(config_hash) {
        Ok(required) => required,
        Err(err) => {
            debug!(%err, "reconsent flag fetch failed, assuming not required");
            false
        }
    }
}
