//! Content Gating Engine
//!
//! Guarantees that no network-fetching element under the host tree is
//! allowed to fetch unless its category is granted, while tolerating
//! elements added before, during and after any consent decision. Owns the
//! blocked-element ledger exclusively; all outside interaction goes
//! through [`GatingEngine::on_consent_changed`].

use crate::placeholder::{is_placeholder, placeholder_for, with_param, PLACEHOLDER_SRC_ATTR};
use crate::{ElementSpec, ElementTag, GateError, HostPage, Mutation, NodeId, Result};
use consentry_core::{CategoryGrants, ConsentCategory, EmbedKind, PolicyTable};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Explicit opt-in attribute: names a declared service whose category
/// gates the element. Takes precedence over the domain match when the key
/// is known; unknown keys fall back to the domain match.
pub const SERVICE_ATTR: &str = "data-consent-service";
/// Where a neutralized element's locator is stashed.
pub const BLOCKED_SRC_ATTR: &str = "data-consent-src";
/// Non-executing `type` marker for neutralized scripts.
pub const BLOCKED_TYPE: &str = "text/blocked";

/// Dimension (inclusive) at or under which an image is presumed to be a
/// tracking pixel.
const TRACKING_PIXEL_MAX: u32 = 2;

/// What kind of gating was applied to an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockedKind {
    Script,
    Frame,
    Image,
    /// Gated through the explicit opt-in attribute.
    ServiceAttr,
}

/// One currently-neutralized element. Engine-owned, never exposed.
#[derive(Debug, Clone)]
struct BlockedElement {
    /// The live node to act on: the neutralized element itself, or its
    /// placeholder when the original was swapped out.
    node: NodeId,
    kind: BlockedKind,
    tag: ElementTag,
    category: ConsentCategory,
    /// The not-yet-fetched resource address.
    original_locator: String,
    /// Attribute snapshot from before neutralization, for rebuilds.
    original_attrs: BTreeMap<String, String>,
    placeholder: Option<NodeId>,
}

/// The content gating engine. Constructed eagerly, ahead of page-ready,
/// with zero grants: blocking is default-on.
pub struct GatingEngine<P: HostPage> {
    page: Arc<RwLock<P>>,
    policy: Arc<PolicyTable>,
    blocked: RwLock<HashMap<NodeId, BlockedElement>>,
    /// Nodes already classified once; guarantees exactly-once processing
    /// even when the watcher re-delivers an insertion.
    processed: RwLock<HashSet<NodeId>>,
    grants: RwLock<CategoryGrants>,
    watching: RwLock<bool>,
}

impl<P: HostPage> GatingEngine<P> {
    pub fn new(page: Arc<RwLock<P>>, policy: Arc<PolicyTable>) -> Self {
        Self {
            page,
            policy,
            blocked: RwLock::new(HashMap::new()),
            processed: RwLock::new(HashSet::new()),
            grants: RwLock::new(CategoryGrants::none()),
            watching: RwLock::new(true),
        }
    }

    /// Whether structural-change notifications are still being acted on.
    /// Watching stops once no category remains ungranted.
    pub fn is_watching(&self) -> bool {
        *self.watching.read()
    }

    /// Number of currently neutralized elements.
    pub fn blocked_count(&self) -> usize {
        self.blocked.read().len()
    }

    /// Whether a specific node is currently neutralized (placeholder
    /// nodes count for their original).
    pub fn is_blocked(&self, id: NodeId) -> bool {
        self.blocked.read().contains_key(&id)
    }

    /// The grant set the engine is currently honoring.
    pub fn grants(&self) -> CategoryGrants {
        *self.grants.read()
    }

    /// Classify one element: explicit opt-in attribute first (when it
    /// names a known service), then the policy table's domain patterns.
    /// `None` means out-of-policy: the element is left untouched.
    pub fn classify(&self, id: NodeId) -> Result<Option<ConsentCategory>> {
        let page = self.page.read();
        let tag = page.tag(id).ok_or(GateError::MissingNode(id))?;
        let attrs = page.attrs(id).ok_or(GateError::MissingNode(id))?;
        drop(page);
        Ok(self.classify_attrs(&tag, &attrs).map(|(category, _)| category))
    }

    fn classify_attrs(
        &self,
        tag: &ElementTag,
        attrs: &BTreeMap<String, String>,
    ) -> Option<(ConsentCategory, bool)> {
        if let Some(key) = attrs.get(SERVICE_ATTR) {
            if let Some(service) = self.policy.service(key) {
                return Some((service.category, true));
            }
            debug!(key, "unknown service key, falling back to domain match");
        }
        if !tag.fetches() {
            return None;
        }
        let locator = attrs.get("src")?;
        self.policy
            .classify_url(locator)
            .map(|category| (category, false))
    }

    /// Full-tree pass: run every element through classify/neutralize once.
    /// Per-element failures are logged and never abort siblings.
    pub fn scan(&self) {
        let ids = self.page.read().node_ids();
        for id in ids {
            if let Err(err) = self.process_node(id) {
                warn!(node = %id, %err, "skipping element during scan");
            }
        }
    }

    /// Drain pending structural-change micro-batches. Each added element
    /// is processed exactly once; inert after watching stops.
    pub fn pump(&self) {
        let mutations = self.page.write().take_mutations();
        if !self.is_watching() {
            return;
        }
        for mutation in mutations {
            let Mutation::Added(id) = mutation;
            if let Err(err) = self.process_node(id) {
                warn!(node = %id, %err, "skipping inserted element");
            }
        }
    }

    fn mark_processed(&self, id: NodeId) -> bool {
        self.processed.write().insert(id)
    }

    fn process_node(&self, id: NodeId) -> Result<()> {
        if !self.mark_processed(id) {
            return Ok(());
        }

        let page = self.page.read();
        if !page.contains(id) {
            // Removed between notification and processing; nothing to gate.
            return Ok(());
        }
        let tag = page.tag(id).ok_or(GateError::MissingNode(id))?;
        let attrs = page.attrs(id).ok_or(GateError::MissingNode(id))?;
        drop(page);

        if is_placeholder(&attrs) {
            return Ok(());
        }

        let Some((category, via_service)) = self.classify_attrs(&tag, &attrs) else {
            return Ok(());
        };
        if self.grants.read().granted(category) {
            return Ok(());
        }
        self.neutralize(id, tag, attrs, category, via_service)
    }

    /// Neutralize one classified element so it cannot fetch.
    fn neutralize(
        &self,
        id: NodeId,
        tag: ElementTag,
        attrs: BTreeMap<String, String>,
        category: ConsentCategory,
        via_service: bool,
    ) -> Result<()> {
        let Some(locator) = attrs.get("src").cloned() else {
            // Nothing fetch-triggering to neutralize.
            return Ok(());
        };

        let kind = if via_service {
            BlockedKind::ServiceAttr
        } else {
            match tag {
                ElementTag::Script => BlockedKind::Script,
                ElementTag::Frame => BlockedKind::Frame,
                ElementTag::Image => BlockedKind::Image,
                ElementTag::Other(_) => return Ok(()),
            }
        };

        let mut entry = BlockedElement {
            node: id,
            kind,
            tag: tag.clone(),
            category,
            original_locator: locator.clone(),
            original_attrs: attrs.clone(),
            placeholder: None,
        };

        match tag {
            ElementTag::Script => {
                let mut page = self.page.write();
                page.remove_attr(id, "src");
                page.set_attr(id, BLOCKED_SRC_ATTR, &locator);
                page.set_attr(id, "type", BLOCKED_TYPE);
            }
            ElementTag::Frame => {
                if let Some(provider) = self.policy.embed_for_url(&locator) {
                    let spec = placeholder_for(provider, &locator);
                    let mut page = self.page.write();
                    let placeholder_id = page
                        .replace(id, spec)
                        .ok_or(GateError::MissingNode(id))?;
                    drop(page);
                    self.mark_processed(placeholder_id);
                    entry.node = placeholder_id;
                    entry.placeholder = Some(placeholder_id);
                } else {
                    let mut page = self.page.write();
                    page.remove_attr(id, "src");
                    page.set_attr(id, BLOCKED_SRC_ATTR, &locator);
                    page.set_hidden(id, true);
                }
            }
            ElementTag::Image => {
                if !is_tracking_pixel(&attrs) {
                    // Stripping real content images would break the host
                    // page; only presumed pixels are gated.
                    return Ok(());
                }
                let mut page = self.page.write();
                page.remove_attr(id, "src");
                page.set_attr(id, BLOCKED_SRC_ATTR, &locator);
            }
            ElementTag::Other(_) => return Ok(()),
        }

        debug!(node = %entry.node, category = category.as_str(), kind = ?entry.kind, "neutralized element");
        self.blocked.write().insert(entry.node, entry);
        Ok(())
    }

    /// Reverse a neutralization exactly. Scripts are destroyed and
    /// reconstructed: re-activating a non-fetching script in place does
    /// not trigger a fetch.
    fn restore(&self, entry: &BlockedElement) -> Result<()> {
        match (&entry.tag, entry.placeholder) {
            (ElementTag::Script, _) => {
                let mut attrs = entry.original_attrs.clone();
                attrs.remove(BLOCKED_SRC_ATTR);
                attrs.insert("src".into(), entry.original_locator.clone());
                let spec = ElementSpec {
                    tag: ElementTag::Script,
                    attrs,
                };
                let mut page = self.page.write();
                let new_id = page
                    .replace(entry.node, spec)
                    .ok_or(GateError::MissingNode(entry.node))?;
                drop(page);
                self.mark_processed(new_id);
            }
            (ElementTag::Frame, Some(placeholder_id)) => {
                let mut locator = entry.original_locator.clone();
                if let Some(provider) = self.policy.embed_for_url(&locator) {
                    if provider.kind == EmbedKind::Video {
                        if let Some(param) = &provider.autoplay_param {
                            locator = with_param(&locator, param);
                        }
                    }
                }
                let mut attrs = entry.original_attrs.clone();
                attrs.remove(PLACEHOLDER_SRC_ATTR);
                attrs.insert("src".into(), locator);
                let spec = ElementSpec {
                    tag: ElementTag::Frame,
                    attrs,
                };
                let mut page = self.page.write();
                let new_id = page
                    .replace(placeholder_id, spec)
                    .ok_or(GateError::MissingNode(placeholder_id))?;
                drop(page);
                self.mark_processed(new_id);
            }
            (ElementTag::Frame, None) => {
                let mut page = self.page.write();
                if !page.contains(entry.node) {
                    return Err(GateError::MissingNode(entry.node));
                }
                page.remove_attr(entry.node, BLOCKED_SRC_ATTR);
                page.set_attr(entry.node, "src", &entry.original_locator);
                page.set_hidden(entry.node, false);
            }
            (ElementTag::Image, _) => {
                let mut page = self.page.write();
                if !page.contains(entry.node) {
                    return Err(GateError::MissingNode(entry.node));
                }
                page.remove_attr(entry.node, BLOCKED_SRC_ATTR);
                page.set_attr(entry.node, "src", &entry.original_locator);
            }
            (ElementTag::Other(_), _) => {
                return Err(GateError::Classification(format!(
                    "ledger entry {} has a non-fetching tag",
                    entry.node
                )));
            }
        }

        debug!(node = %entry.node, category = entry.category.as_str(), "restored element");
        Ok(())
    }

    /// React to an applied consent decision: restore every neutralized
    /// element whose category is now granted. Grants only ever widen
    /// (monotonic); once every category is granted, watching stops.
    pub fn on_consent_changed(&self, grants: &CategoryGrants) {
        let merged = self.grants.read().merge(grants);
        *self.grants.write() = merged;

        let to_restore: Vec<BlockedElement> = {
            let mut blocked = self.blocked.write();
            let keys: Vec<NodeId> = blocked
                .iter()
                .filter(|(_, e)| merged.granted(e.category))
                .map(|(id, _)| *id)
                .collect();
            keys.iter().filter_map(|id| blocked.remove(id)).collect()
        };

        for entry in &to_restore {
            if let Err(err) = self.restore(entry) {
                warn!(node = %entry.node, %err, "failed to restore element");
            }
        }

        if merged.all_granted() {
            debug!("all categories granted, gating work complete");
            *self.watching.write() = false;
        }
    }
}

/// Presumed tracking pixel: both dimensions declared and at most 2px.
fn is_tracking_pixel(attrs: &BTreeMap<String, String>) -> bool {
    let dim = |name: &str| attrs.get(name).and_then(|v| v.parse::<u32>().ok());
    matches!(
        (dim("width"), dim("height")),
        (Some(w), Some(h)) if w <= TRACKING_PIXEL_MAX && h <= TRACKING_PIXEL_MAX
    )
}

impl<P: HostPage> std::fmt::Debug for GatingEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatingEngine")
            .field("blocked", &self.blocked_count())
            .field("watching", &self.is_watching())
            .finish_non_exhaustive()
    }
}
