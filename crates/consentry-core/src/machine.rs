//! Consent State Machine
//!
//! Orchestrates the consent lifecycle: determine whether a decision is
//! needed, apply an existing or fresh decision, persist it, and broadcast
//! it. Applying is idempotent; the decision flow never blocks on a remote
//! call.

use crate::{
    CategorySelection, ConsentBus, ConsentChanged, ConsentLogSink, ConsentModeBridge,
    ConsentRecord, ConsentSignal, ConsentStore, EventLogBridge, PolicyTable, StoredConsent,
};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Lifecycle states. `Decided` and `Applied` collapse into one step: a
/// decision is only observable once its effects have run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Uninitialized,
    NeedsDecision,
    Applied,
}

/// Why a fresh decision is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// No record exists.
    FirstVisit,
    /// The record is older than the configured lifetime.
    Expired,
    /// The record is scoped to a different policy configuration.
    ConfigChanged,
    /// The site operator flagged this configuration for reconsent.
    ReconsentRequested,
}

/// Why a decision was auto-recorded as reject-all without rendering UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRejectReason {
    /// The visitor's do-not-track preference is set and honored.
    DoNotTrack,
    /// The visitor's region is excluded from consent soliciting.
    GeoRestricted,
    /// The page declares no optional services, so soliciting consent would
    /// be noise: nothing needs gating.
    NoServicesConfigured,
}

/// Outcome of evaluating the lifecycle at load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// A valid decision exists; apply it and exit.
    Apply(ConsentRecord),
    /// Defer to the presentation layer for a decision.
    NeedsDecision(DecisionReason),
    /// Record an implicit reject-all without UI.
    AutoReject(AutoRejectReason),
}

/// Policy inputs gathered before evaluation. All remote lookups behind
/// these values have already been resolved with their fail-safe defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootInput {
    pub do_not_track: bool,
    pub geo_in_scope: bool,
    pub reconsent_required: bool,
}

/// The consent lifecycle manager. Sole writer of the persisted record.
pub struct ConsentStateMachine {
    store: Arc<ConsentStore>,
    policy: Arc<PolicyTable>,
    bus: Arc<ConsentBus>,
    signal_bridge: ConsentModeBridge,
    event_bridge: EventLogBridge,
    log_sink: Box<dyn ConsentLogSink>,
    lifetime_days: u32,
    honor_do_not_track: bool,
    state: RwLock<MachineState>,
    last_applied: RwLock<Option<String>>,
}

impl ConsentStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ConsentStore>,
        policy: Arc<PolicyTable>,
        bus: Arc<ConsentBus>,
        signal_bridge: ConsentModeBridge,
        event_bridge: EventLogBridge,
        log_sink: Box<dyn ConsentLogSink>,
        lifetime_days: u32,
        honor_do_not_track: bool,
    ) -> Self {
        Self {
            store,
            policy,
            bus,
            signal_bridge,
            event_bridge,
            log_sink,
            lifetime_days,
            honor_do_not_track,
            state: RwLock::new(MachineState::Uninitialized),
            last_applied: RwLock::new(None),
        }
    }

    pub fn state(&self) -> MachineState {
        *self.state.read()
    }

    /// Announce the pre-decision signal default (grace window) once.
    /// Runs at page load before any evaluation.
    pub fn announce_signal_default(&self, wait_millis: u32) {
        self.signal_bridge.announce_default(wait_millis);
    }

    /// Compute whether a decision is required. A stored record survives
    /// only if it is unexpired AND scoped to the active configuration; a
    /// config-version mismatch discards it and forces reconsent.
    pub fn evaluate(&self, input: &BootInput) -> Evaluation {
        let current_hash = self.policy.config_hash();

        let reason = match self.store.load_state(self.lifetime_days) {
            StoredConsent::Valid(record) => {
                if record.config_version != current_hash {
                    debug!(
                        stored = %record.config_version,
                        active = %current_hash,
                        "policy configuration changed, forcing reconsent"
                    );
                    self.store.clear();
                    DecisionReason::ConfigChanged
                } else if input.reconsent_required {
                    self.store.clear();
                    DecisionReason::ReconsentRequested
                } else {
                    return Evaluation::Apply(record);
                }
            }
            StoredConsent::Expired => DecisionReason::Expired,
            StoredConsent::Missing => DecisionReason::FirstVisit,
        };

        // Short-circuit inputs: an implicit reject-all without UI.
        if !self.policy.has_optional_services() {
            return Evaluation::AutoReject(AutoRejectReason::NoServicesConfigured);
        }
        if self.honor_do_not_track && input.do_not_track {
            return Evaluation::AutoReject(AutoRejectReason::DoNotTrack);
        }
        if !input.geo_in_scope {
            return Evaluation::AutoReject(AutoRejectReason::GeoRestricted);
        }

        *self.state.write() = MachineState::NeedsDecision;
        Evaluation::NeedsDecision(reason)
    }

    /// Build and persist a record for a visitor decision, then apply it.
    pub fn decide(
        &self,
        selection: CategorySelection,
        granted_services: BTreeSet<String>,
    ) -> ConsentRecord {
        let record = ConsentRecord::new(selection, granted_services, &self.policy.config_hash());
        self.store.save(&record);
        self.apply(&record);
        record
    }

    /// Record an implicit reject-all (short-circuit inputs) and apply it.
    pub fn auto_reject(&self, reason: AutoRejectReason) -> ConsentRecord {
        debug!(?reason, "auto-recording reject-all decision");
        let record = ConsentRecord::reject_all(&self.policy.config_hash());
        self.store.save(&record);
        self.apply(&record);
        record
    }

    /// Apply a record: compute the signal, invoke the bridge adapters,
    /// broadcast, then fire the audit sink. Idempotent: re-applying the
    /// same record produces no second round of external effects. Returns
    /// whether effects ran.
    pub fn apply(&self, record: &ConsentRecord) -> bool {
        let id = record.record_id();
        if self.last_applied.read().as_deref() == Some(id.as_str()) {
            *self.state.write() = MachineState::Applied;
            return false;
        }

        let signal = ConsentSignal::from_record(record);
        self.signal_bridge.push(&signal);
        self.event_bridge.push_update(record);
        self.bus.dispatch(&ConsentChanged::from_record(record));

        // Fire-and-forget audit logging; never blocks the flow.
        if let Err(err) = self.log_sink.log_decision(record, &self.store.visitor_id()) {
            debug!(%err, "consent audit logging failed");
        }

        *self.last_applied.write() = Some(id);
        *self.state.write() = MachineState::Applied;
        true
    }

    /// The currently stored, valid record, if any.
    pub fn current(&self) -> Option<ConsentRecord> {
        self.store.load(self.lifetime_days)
    }
}

impl std::fmt::Debug for ConsentStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentStateMachine")
            .field("state", &self.state())
            .field("lifetime_days", &self.lifetime_days)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ConsentCategory, ConsentEvent, EventSink, NullLogSink, ServiceDescriptor,
    };
    use chrono::{Duration, Utc};
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct CountingEventSink {
        events: Arc<Mutex<Vec<ConsentEvent>>>,
    }

    impl EventSink for CountingEventSink {
        fn push(&self, event: ConsentEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn analytics_service() -> ServiceDescriptor {
        ServiceDescriptor {
            key: "ga4".into(),
            category: ConsentCategory::Analytics,
            name: "Analytics".into(),
            provider: "Test".into(),
            cookies: vec![],
        }
    }

    fn machine_with(
        policy: PolicyTable,
        event_sink: Option<CountingEventSink>,
    ) -> ConsentStateMachine {
        let event_bridge = match event_sink {
            Some(sink) => EventLogBridge::new(Box::new(sink)),
            None => EventLogBridge::disabled(),
        };
        ConsentStateMachine::new(
            Arc::new(ConsentStore::in_memory()),
            Arc::new(policy),
            Arc::new(ConsentBus::new()),
            ConsentModeBridge::disabled(),
            event_bridge,
            Box::new(NullLogSink),
            365,
            true,
        )
    }

    fn solicitable_policy() -> PolicyTable {
        PolicyTable::builtin().with_services([analytics_service()])
    }

    fn in_scope() -> BootInput {
        BootInput {
            do_not_track: false,
            geo_in_scope: true,
            reconsent_required: false,
        }
    }

    #[test]
    fn first_visit_needs_decision() {
        let machine = machine_with(solicitable_policy(), None);
        assert_eq!(
            machine.evaluate(&in_scope()),
            Evaluation::NeedsDecision(DecisionReason::FirstVisit)
        );
        assert_eq!(machine.state(), MachineState::NeedsDecision);
    }

    #[test]
    fn valid_record_applies_directly() {
        let machine = machine_with(solicitable_policy(), None);
        let record = machine.decide(CategorySelection::accept_all(), BTreeSet::new());

        assert_eq!(machine.evaluate(&in_scope()), Evaluation::Apply(record));
    }

    #[test]
    fn expired_record_needs_decision() {
        let machine = machine_with(solicitable_policy(), None);
        let record = ConsentRecord::accept_all(BTreeSet::new(), &solicitable_policy().config_hash())
            .with_timestamp(Utc::now() - Duration::days(366));
        machine.store.save(&record);

        assert_eq!(
            machine.evaluate(&in_scope()),
            Evaluation::NeedsDecision(DecisionReason::Expired)
        );
    }

    #[test]
    fn config_change_forces_reconsent_and_clears() {
        let machine = machine_with(solicitable_policy(), None);
        let stale = ConsentRecord::accept_all(BTreeSet::new(), "h-old");
        machine.store.save(&stale);

        assert_eq!(
            machine.evaluate(&in_scope()),
            Evaluation::NeedsDecision(DecisionReason::ConfigChanged)
        );
        // The stale record was discarded, so the next evaluation sees a
        // first visit.
        assert_eq!(
            machine.evaluate(&in_scope()),
            Evaluation::NeedsDecision(DecisionReason::FirstVisit)
        );
    }

    #[test]
    fn reconsent_flag_forces_fresh_decision() {
        let machine = machine_with(solicitable_policy(), None);
        machine.decide(CategorySelection::accept_all(), BTreeSet::new());

        let input = BootInput {
            reconsent_required: true,
            ..in_scope()
        };
        assert_eq!(
            machine.evaluate(&input),
            Evaluation::NeedsDecision(DecisionReason::ReconsentRequested)
        );
    }

    #[test]
    fn do_not_track_auto_rejects() {
        let machine = machine_with(solicitable_policy(), None);
        let input = BootInput {
            do_not_track: true,
            ..in_scope()
        };
        assert_eq!(
            machine.evaluate(&input),
            Evaluation::AutoReject(AutoRejectReason::DoNotTrack)
        );

        let record = machine.auto_reject(AutoRejectReason::DoNotTrack);
        assert!(!record.functional && !record.analytics && !record.marketing);
        // The auto decision is persisted like any other.
        assert_eq!(machine.current(), Some(record));
    }

    #[test]
    fn geo_restriction_auto_rejects() {
        let machine = machine_with(solicitable_policy(), None);
        let input = BootInput {
            geo_in_scope: false,
            ..in_scope()
        };
        assert_eq!(
            machine.evaluate(&input),
            Evaluation::AutoReject(AutoRejectReason::GeoRestricted)
        );
    }

    #[test]
    fn zero_services_auto_rejects_without_ui() {
        // Builtin table, no declared services: nothing needs gating.
        let machine = machine_with(PolicyTable::builtin(), None);
        assert_eq!(
            machine.evaluate(&in_scope()),
            Evaluation::AutoReject(AutoRejectReason::NoServicesConfigured)
        );

        let record = machine.auto_reject(AutoRejectReason::NoServicesConfigured);
        assert!(record.necessary);
        assert!(!record.functional && !record.analytics && !record.marketing);
    }

    #[test]
    fn apply_is_idempotent() {
        let sink = CountingEventSink::default();
        let events = sink.events.clone();
        let machine = machine_with(solicitable_policy(), Some(sink));

        let record = machine.decide(CategorySelection::accept_all(), BTreeSet::new());
        let first_count = events.lock().unwrap().len();
        assert!(first_count > 0);

        assert!(!machine.apply(&record));
        assert_eq!(events.lock().unwrap().len(), first_count);
    }

    #[test]
    fn new_decision_supersedes_stored_record() {
        let machine = machine_with(solicitable_policy(), None);
        machine.decide(CategorySelection::accept_all(), BTreeSet::new());

        let second = machine.decide(CategorySelection::reject_all(), BTreeSet::new());
        assert_eq!(machine.current(), Some(second.clone()));
        assert!(!second.marketing);
    }
}
