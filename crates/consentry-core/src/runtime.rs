//! Runtime facade
//!
//! `ConsentRuntime` is the control surface exposed to the host page: boot
//! the lifecycle, submit decisions, query and subscribe to consent, revoke.
//! Assembled through a builder so embedders can swap the storage backend
//! and the remote collaborators.

use crate::{
    BootInput, CategorySelection, ConfigSource, ConsentBus, ConsentCategory, ConsentChanged,
    ConsentLogSink, ConsentModeBridge, ConsentRecord, ConsentStateMachine, ConsentStore,
    EventLogBridge, EventSink, Evaluation, GeoLookup, ListenerId, ListenerScope, MachineState,
    NullGeoLookup, NullLogSink, NullReconsentFlag, PolicyTable, ReconsentFlagSource, SignalSink,
    SiteConfig, StaticConfigSource, StorageBackend, AutoRejectReason, DecisionReason,
    load_site_config, resolve_geo, resolve_reconsent_flag,
};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Grace window announced to signal consumers before any decision, in
/// milliseconds.
const SIGNAL_WAIT_MILLIS: u32 = 500;

/// What `boot` concluded, so the (external) presentation layer knows
/// whether to render a decision UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    /// An existing decision was applied; no UI.
    Applied(ConsentRecord),
    /// The presentation layer must solicit a decision.
    DecisionRequired(DecisionReason),
    /// A reject-all was recorded implicitly; no UI.
    AutoRejected(AutoRejectReason, ConsentRecord),
}

/// The page-wide consent runtime. One instance per page life.
pub struct ConsentRuntime {
    machine: ConsentStateMachine,
    store: Arc<ConsentStore>,
    policy: Arc<PolicyTable>,
    bus: Arc<ConsentBus>,
    config: SiteConfig,
    geo: Box<dyn GeoLookup>,
    reconsent: Box<dyn ReconsentFlagSource>,
    do_not_track: bool,
    reload_requested: RwLock<bool>,
    resolicit_requested: RwLock<bool>,
}

impl ConsentRuntime {
    pub fn builder() -> ConsentRuntimeBuilder {
        ConsentRuntimeBuilder::new()
    }

    /// Run the load-time lifecycle: announce the signal default, resolve
    /// the policy inputs, then apply an existing decision, auto-record a
    /// reject-all, or defer to presentation. Gating setup is independent
    /// and must already be running when this is called.
    pub fn boot(&self) -> BootOutcome {
        // Deterministic default for third-party tags that initialize
        // immediately, announced before any signal is set.
        self.machine.announce_signal_default(SIGNAL_WAIT_MILLIS);

        // The geo lookup only runs for sites that declare a regional
        // restriction; everyone else is in scope.
        let geo_in_scope = !self.config.geo_restricted || resolve_geo(self.geo.as_ref());

        let input = BootInput {
            do_not_track: self.do_not_track,
            geo_in_scope,
            reconsent_required: resolve_reconsent_flag(
                self.reconsent.as_ref(),
                &self.policy.config_hash(),
            ),
        };

        match self.machine.evaluate(&input) {
            Evaluation::Apply(record) => {
                self.machine.apply(&record);
                BootOutcome::Applied(record)
            }
            Evaluation::AutoReject(reason) => {
                let record = self.machine.auto_reject(reason);
                BootOutcome::AutoRejected(reason, record)
            }
            Evaluation::NeedsDecision(reason) => BootOutcome::DecisionRequired(reason),
        }
    }

    /// Accept-all terminal input. Grants every declared service.
    pub fn accept_all(&self) -> ConsentRecord {
        let services: BTreeSet<String> = self
            .policy
            .services()
            .filter(|s| s.category.is_optional())
            .map(|s| s.key.clone())
            .collect();
        *self.resolicit_requested.write() = false;
        self.machine.decide(CategorySelection::accept_all(), services)
    }

    /// Reject-all terminal input.
    pub fn reject_all(&self) -> ConsentRecord {
        *self.resolicit_requested.write() = false;
        self.machine.decide(CategorySelection::reject_all(), BTreeSet::new())
    }

    /// Custom-save terminal input.
    pub fn save_custom(
        &self,
        selection: CategorySelection,
        granted_services: BTreeSet<String>,
    ) -> ConsentRecord {
        *self.resolicit_requested.write() = false;
        self.machine.decide(selection, granted_services)
    }

    /// The stored, valid consent record, if any.
    pub fn current_consent(&self) -> Option<ConsentRecord> {
        self.machine.current()
    }

    /// Check a single category against the current record. No record means
    /// only `Necessary` is granted.
    pub fn is_granted(&self, category: ConsentCategory) -> bool {
        match self.current_consent() {
            Some(record) => record.granted(category),
            None => category == ConsentCategory::Necessary,
        }
    }

    /// Subscribe to consent changes on one listener scope.
    pub fn subscribe<F>(&self, scope: ListenerScope, callback: F) -> ListenerId
    where
        F: Fn(&ConsentChanged) + Send + Sync + 'static,
    {
        self.bus.subscribe(scope, callback)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Revoke consent: clear the store, leave a revocation marker, and
    /// request a page reload. Already-fetching elements are never
    /// re-neutralized in place; the reload is what re-blocks.
    pub fn revoke(&self) {
        info!("consent revoked, requesting page reload");
        self.store.clear();
        self.store.mark_revoked();
        *self.reload_requested.write() = true;
    }

    /// Whether `revoke` asked the embedder to reload the page.
    pub fn reload_requested(&self) -> bool {
        *self.reload_requested.read()
    }

    /// Force the decision UI to be shown again. A fresh decision flow that
    /// supersedes the stored record at save time; the stored record stays
    /// in effect until then.
    pub fn request_resolicit(&self) {
        *self.resolicit_requested.write() = true;
    }

    pub fn resolicit_requested(&self) -> bool {
        *self.resolicit_requested.read()
    }

    /// Stable anonymous visitor identifier.
    pub fn visitor_id(&self) -> String {
        self.store.visitor_id()
    }

    /// The policy table active on this page (shared with the gating
    /// engine).
    pub fn policy(&self) -> Arc<PolicyTable> {
        self.policy.clone()
    }

    /// The active site configuration after fetch/fallback.
    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    pub fn state(&self) -> MachineState {
        self.machine.state()
    }
}

impl std::fmt::Debug for ConsentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentRuntime")
            .field("state", &self.state())
            .field("reload_requested", &self.reload_requested())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ConsentRuntime`].
pub struct ConsentRuntimeBuilder {
    policy: PolicyTable,
    backend: Option<Box<dyn StorageBackend>>,
    config_source: Box<dyn ConfigSource>,
    geo: Box<dyn GeoLookup>,
    log_sink: Box<dyn ConsentLogSink>,
    reconsent: Box<dyn ReconsentFlagSource>,
    signal_sink: Option<Box<dyn SignalSink>>,
    event_sink: Option<Box<dyn EventSink>>,
    do_not_track: bool,
}

impl ConsentRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            policy: PolicyTable::builtin(),
            backend: None,
            config_source: Box::new(StaticConfigSource(SiteConfig::default())),
            geo: Box::new(NullGeoLookup),
            log_sink: Box::new(NullLogSink),
            reconsent: Box::new(NullReconsentFlag),
            signal_sink: None,
            event_sink: None,
            do_not_track: false,
        }
    }

    /// Replace the base policy table (site-declared services are merged in
    /// from the fetched configuration at build time).
    pub fn policy(mut self, policy: PolicyTable) -> Self {
        self.policy = policy;
        self
    }

    pub fn storage(mut self, backend: Box<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.config_source = source;
        self
    }

    pub fn geo_lookup(mut self, geo: Box<dyn GeoLookup>) -> Self {
        self.geo = geo;
        self
    }

    pub fn log_sink(mut self, sink: Box<dyn ConsentLogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn reconsent_source(mut self, source: Box<dyn ReconsentFlagSource>) -> Self {
        self.reconsent = source;
        self
    }

    pub fn signal_sink(mut self, sink: Box<dyn SignalSink>) -> Self {
        self.signal_sink = Some(sink);
        self
    }

    pub fn event_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// The visitor's do-not-track preference, read by the embedder.
    pub fn do_not_track(mut self, dnt: bool) -> Self {
        self.do_not_track = dnt;
        self
    }

    pub fn build(self) -> ConsentRuntime {
        // Fetch-or-fallback; the flow never stalls on this.
        let config = load_site_config(self.config_source.as_ref(), &SiteConfig::default());
        let policy = Arc::new(self.policy.with_services(config.services.clone()));

        let store = Arc::new(ConsentStore::new(
            self.backend
                .unwrap_or_else(|| Box::new(crate::MemoryStorage::new())),
        ));
        if let Some(variant) = &config.variant_hash {
            store.set_variant_hash(variant);
        }

        let bus = Arc::new(ConsentBus::new());
        let signal_bridge = match self.signal_sink {
            Some(sink) => ConsentModeBridge::new(sink),
            None => ConsentModeBridge::disabled(),
        };
        let event_bridge = match self.event_sink {
            Some(sink) => EventLogBridge::new(sink),
            None => EventLogBridge::disabled(),
        };

        let machine = ConsentStateMachine::new(
            store.clone(),
            policy.clone(),
            bus.clone(),
            signal_bridge,
            event_bridge,
            self.log_sink,
            config.lifetime_days,
            config.honor_do_not_track,
        );

        ConsentRuntime {
            machine,
            store,
            policy,
            bus,
            config,
            geo: self.geo,
            reconsent: self.reconsent,
            do_not_track: self.do_not_track,
            reload_requested: RwLock::new(false),
            resolicit_requested: RwLock::new(false),
        }
    }
}

impl Default for ConsentRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceDescriptor;

    fn analytics_service() -> ServiceDescriptor {
        ServiceDescriptor {
            key: "ga4".into(),
            category: ConsentCategory::Analytics,
            name: "Analytics".into(),
            provider: "Test".into(),
            cookies: vec![],
        }
    }

    fn solicitable_runtime() -> ConsentRuntime {
        let config = SiteConfig {
            services: vec![analytics_service()],
            ..Default::default()
        };
        ConsentRuntime::builder()
            .config_source(Box::new(StaticConfigSource(config)))
            .build()
    }

    #[test]
    fn boot_requires_decision_on_first_visit() {
        let runtime = solicitable_runtime();
        assert_eq!(
            runtime.boot(),
            BootOutcome::DecisionRequired(DecisionReason::FirstVisit)
        );
        assert!(!runtime.is_granted(ConsentCategory::Analytics));
        assert!(runtime.is_granted(ConsentCategory::Necessary));
    }

    #[test]
    fn boot_applies_existing_decision() {
        let runtime = solicitable_runtime();
        runtime.boot();
        let record = runtime.accept_all();

        // Same storage would normally persist across loads; within one
        // runtime a second boot applies the stored record.
        assert_eq!(runtime.boot(), BootOutcome::Applied(record));
    }

    #[test]
    fn boot_auto_rejects_with_zero_services() {
        let runtime = ConsentRuntime::builder().build();
        match runtime.boot() {
            BootOutcome::AutoRejected(AutoRejectReason::NoServicesConfigured, record) => {
                assert!(!record.analytics);
            }
            other => panic!("expected auto-reject, got {other:?}"),
        }
    }

    #[test]
    fn boot_auto_rejects_on_do_not_track() {
        let config = SiteConfig {
            services: vec![analytics_service()],
            ..Default::default()
        };
        let runtime = ConsentRuntime::builder()
            .config_source(Box::new(StaticConfigSource(config)))
            .do_not_track(true)
            .build();

        assert!(matches!(
            runtime.boot(),
            BootOutcome::AutoRejected(AutoRejectReason::DoNotTrack, _)
        ));
    }

    struct OutOfScopeGeo;

    impl GeoLookup for OutOfScopeGeo {
        fn visitor_in_scope(&self) -> crate::Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn geo_lookup_only_matters_on_restricted_sites() {
        let restricted = SiteConfig {
            services: vec![analytics_service()],
            geo_restricted: true,
            ..Default::default()
        };
        let runtime = ConsentRuntime::builder()
            .config_source(Box::new(StaticConfigSource(restricted)))
            .geo_lookup(Box::new(OutOfScopeGeo))
            .build();
        assert!(matches!(
            runtime.boot(),
            BootOutcome::AutoRejected(AutoRejectReason::GeoRestricted, _)
        ));

        // Without the restriction flag the lookup is not consulted.
        let open = SiteConfig {
            services: vec![analytics_service()],
            ..Default::default()
        };
        let runtime = ConsentRuntime::builder()
            .config_source(Box::new(StaticConfigSource(open)))
            .geo_lookup(Box::new(OutOfScopeGeo))
            .build();
        assert!(matches!(runtime.boot(), BootOutcome::DecisionRequired(_)));
    }

    #[test]
    fn accept_all_grants_declared_services() {
        let runtime = solicitable_runtime();
        runtime.boot();
        let record = runtime.accept_all();

        assert!(record.granted_services.contains("ga4"));
        assert!(runtime.is_granted(ConsentCategory::Analytics));
        assert!(runtime.is_granted(ConsentCategory::Marketing));
    }

    #[test]
    fn revoke_clears_and_requests_reload() {
        let runtime = solicitable_runtime();
        runtime.boot();
        runtime.accept_all();
        assert!(runtime.current_consent().is_some());

        runtime.revoke();
        assert!(runtime.current_consent().is_none());
        assert!(runtime.reload_requested());
        assert!(!runtime.is_granted(ConsentCategory::Analytics));
    }

    #[test]
    fn resolicit_flow_supersedes_at_save() {
        let runtime = solicitable_runtime();
        runtime.boot();
        runtime.accept_all();

        runtime.request_resolicit();
        assert!(runtime.resolicit_requested());
        // Stored record stays in effect until a new save.
        assert!(runtime.is_granted(ConsentCategory::Marketing));

        runtime.save_custom(CategorySelection::new(false, true, false), BTreeSet::new());
        assert!(!runtime.resolicit_requested());
        assert!(runtime.is_granted(ConsentCategory::Analytics));
        assert!(!runtime.is_granted(ConsentCategory::Marketing));
    }

    #[test]
    fn subscribers_receive_decisions() {
        use std::sync::{Arc, Mutex};
        let runtime = solicitable_runtime();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        runtime.subscribe(ListenerScope::Window, move |event| {
            s.lock().unwrap().push(event.categories);
        });

        runtime.boot();
        runtime.accept_all();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].marketing);
    }
}
