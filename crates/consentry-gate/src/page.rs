//! Host tree model
//!
//! The gating engine never touches a platform tree directly; it works
//! against [`HostPage`], an abstract "tree + structural-change
//! notifications" capability. [`VirtualPage`] is the reference in-memory
//! implementation used in tests and by embedders that reconcile an
//! external tree themselves.

use std::collections::BTreeMap;
use std::fmt;

/// Identity of one element in the host tree. Never reused within a page
/// life, including across replacements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The element kinds the engine cares about; everything else is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementTag {
    Script,
    Frame,
    Image,
    Other(String),
}

impl ElementTag {
    /// Whether this tag can trigger a network fetch through its locator
    /// attribute.
    pub fn fetches(&self) -> bool {
        matches!(self, ElementTag::Script | ElementTag::Frame | ElementTag::Image)
    }
}

/// Blueprint for creating or replacing an element.
#[derive(Debug, Clone)]
pub struct ElementSpec {
    pub tag: ElementTag,
    pub attrs: BTreeMap<String, String>,
}

impl ElementSpec {
    pub fn new(tag: ElementTag) -> Self {
        Self {
            tag,
            attrs: BTreeMap::new(),
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }
}

/// A structural-change notification. Delivered in micro-batches that may
/// interleave arbitrarily with consent changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Added(NodeId),
}

/// Abstract host tree plus structural-change subscription.
pub trait HostPage: Send + Sync {
    /// All current element ids, in document order.
    fn node_ids(&self) -> Vec<NodeId>;

    /// Whether the node is still in the tree.
    fn contains(&self, id: NodeId) -> bool;

    fn tag(&self, id: NodeId) -> Option<ElementTag>;

    fn attr(&self, id: NodeId, name: &str) -> Option<String>;

    /// Snapshot of all attributes, or `None` for a missing node.
    fn attrs(&self, id: NodeId) -> Option<BTreeMap<String, String>>;

    fn set_attr(&mut self, id: NodeId, name: &str, value: &str);

    /// Remove an attribute, returning its previous value.
    fn remove_attr(&mut self, id: NodeId, name: &str) -> Option<String>;

    fn set_hidden(&mut self, id: NodeId, hidden: bool);

    fn hidden(&self, id: NodeId) -> bool;

    /// Insert a new element, returning its id.
    fn insert(&mut self, spec: ElementSpec) -> NodeId;

    /// Replace an element with a newly created one (the old id dies, the
    /// new id is fresh). Returns `None` when the node is already gone.
    fn replace(&mut self, id: NodeId, spec: ElementSpec) -> Option<NodeId>;

    fn remove(&mut self, id: NodeId);

    /// Drain pending structural-change notifications.
    fn take_mutations(&mut self) -> Vec<Mutation>;
}

#[derive(Debug, Clone)]
struct ElementNode {
    tag: ElementTag,
    attrs: BTreeMap<String, String>,
    hidden: bool,
}

/// Reference in-memory host tree with a mutation queue.
#[derive(Debug, Default)]
pub struct VirtualPage {
    nodes: BTreeMap<NodeId, ElementNode>,
    next_id: u64,
    mutations: Vec<Mutation>,
}

impl VirtualPage {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self, spec: ElementSpec) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            ElementNode {
                tag: spec.tag,
                attrs: spec.attrs,
                hidden: false,
            },
        );
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl HostPage for VirtualPage {
    fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    fn tag(&self, id: NodeId) -> Option<ElementTag> {
        self.nodes.get(&id).map(|n| n.tag.clone())
    }

    fn attr(&self, id: NodeId, name: &str) -> Option<String> {
        self.nodes.get(&id)?.attrs.get(name).cloned()
    }

    fn attrs(&self, id: NodeId) -> Option<BTreeMap<String, String>> {
        self.nodes.get(&id).map(|n| n.attrs.clone())
    }

    fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.attrs.insert(name.to_string(), value.to_string());
        }
    }

    fn remove_attr(&mut self, id: NodeId, name: &str) -> Option<String> {
        self.nodes.get_mut(&id)?.attrs.remove(name)
    }

    fn set_hidden(&mut self, id: NodeId, hidden: bool) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.hidden = hidden;
        }
    }

    fn hidden(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map(|n| n.hidden).unwrap_or(false)
    }

    fn insert(&mut self, spec: ElementSpec) -> NodeId {
        let id = self.allocate(spec);
        self.mutations.push(Mutation::Added(id));
        id
    }

    fn replace(&mut self, id: NodeId, spec: ElementSpec) -> Option<NodeId> {
        if !self.nodes.contains_key(&id) {
            return None;
        }
        self.nodes.remove(&id);
        let new_id = self.allocate(spec);
        self.mutations.push(Mutation::Added(new_id));
        Some(new_id)
    }

    fn remove(&mut self, id: NodeId) {
        self.nodes.remove(&id);
    }

    fn take_mutations(&mut self) -> Vec<Mutation> {
        std::mem::take(&mut self.mutations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(src: &str) -> ElementSpec {
        ElementSpec::new(ElementTag::Script).attr("src", src)
    }

    #[test]
    fn insert_records_mutation() {
        let mut page = VirtualPage::new();
        let id = page.insert(script("https://a.example/x.js"));

        assert!(page.contains(id));
        assert_eq!(page.take_mutations(), vec![Mutation::Added(id)]);
        // Drained queue stays empty.
        assert!(page.take_mutations().is_empty());
    }

    #[test]
    fn replace_allocates_fresh_id() {
        let mut page = VirtualPage::new();
        let id = page.insert(script("https://a.example/x.js"));
        page.take_mutations();

        let new_id = page.replace(id, script("https://a.example/y.js")).unwrap();
        assert_ne!(id, new_id);
        assert!(!page.contains(id));
        assert_eq!(page.attr(new_id, "src").as_deref(), Some("https://a.example/y.js"));
        assert_eq!(page.take_mutations(), vec![Mutation::Added(new_id)]);
    }

    #[test]
    fn attribute_roundtrip_and_hiding() {
        let mut page = VirtualPage::new();
        let id = page.insert(ElementSpec::new(ElementTag::Frame).attr("src", "https://f.example"));

        assert_eq!(page.remove_attr(id, "src").as_deref(), Some("https://f.example"));
        assert_eq!(page.attr(id, "src"), None);

        page.set_attr(id, "src", "https://f.example/2");
        assert_eq!(page.attr(id, "src").as_deref(), Some("https://f.example/2"));

        assert!(!page.hidden(id));
        page.set_hidden(id, true);
        assert!(page.hidden(id));
    }

    #[test]
    fn missing_nodes_are_inert() {
        let mut page = VirtualPage::new();
        let ghost = NodeId(99);
        assert!(page.tag(ghost).is_none());
        assert!(page.replace(ghost, script("x")).is_none());
        page.set_attr(ghost, "src", "x");
        assert!(page.attr(ghost, "src").is_none());
    }
}
