//! Consent categories and category-level grant sets.

use serde::{Deserialize, Serialize};

/// The four consent categories a service or resource can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentCategory {
    /// Required for the site to function; always granted, never user-editable.
    Necessary,
    /// Comfort features (embedded video, maps, chat widgets).
    Functional,
    /// Audience measurement and statistics.
    Analytics,
    /// Advertising, retargeting, conversion tracking.
    Marketing,
}

impl ConsentCategory {
    /// All categories, in disclosure order.
    pub const ALL: [ConsentCategory; 4] = [
        ConsentCategory::Necessary,
        ConsentCategory::Functional,
        ConsentCategory::Analytics,
        ConsentCategory::Marketing,
    ];

    /// The three categories a visitor can actually toggle.
    pub const OPTIONAL: [ConsentCategory; 3] = [
        ConsentCategory::Functional,
        ConsentCategory::Analytics,
        ConsentCategory::Marketing,
    ];

    /// Whether the visitor can deny this category.
    pub fn is_optional(&self) -> bool {
        !matches!(self, ConsentCategory::Necessary)
    }

    /// Stable lowercase name, used in storage keys and event names.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentCategory::Necessary => "necessary",
            ConsentCategory::Functional => "functional",
            ConsentCategory::Analytics => "analytics",
            ConsentCategory::Marketing => "marketing",
        }
    }
}

/// A visitor's choice for the three editable categories.
///
/// `Necessary` is deliberately not representable here: there is no way to
/// construct a selection that denies it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySelection {
    pub functional: bool,
    pub analytics: bool,
    pub marketing: bool,
}

impl CategorySelection {
    /// Everything granted.
    pub fn accept_all() -> Self {
        Self {
            functional: true,
            analytics: true,
            marketing: true,
        }
    }

    /// Everything denied (necessary remains implicitly granted).
    pub fn reject_all() -> Self {
        Self::default()
    }

    pub fn new(functional: bool, analytics: bool, marketing: bool) -> Self {
        Self {
            functional,
            analytics,
            marketing,
        }
    }
}

/// The resolved grant set for all four categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryGrants {
    pub necessary: bool,
    pub functional: bool,
    pub analytics: bool,
    pub marketing: bool,
}

impl CategoryGrants {
    /// Build from a selection; necessary is always true.
    pub fn from_selection(selection: CategorySelection) -> Self {
        Self {
            necessary: true,
            functional: selection.functional,
            analytics: selection.analytics,
            marketing: selection.marketing,
        }
    }

    /// The state before any decision: only necessary.
    pub fn none() -> Self {
        Self::from_selection(CategorySelection::reject_all())
    }

    /// All four categories granted.
    pub fn all() -> Self {
        Self::from_selection(CategorySelection::accept_all())
    }

    /// Whether a single category is granted.
    pub fn granted(&self, category: ConsentCategory) -> bool {
        match category {
            ConsentCategory::Necessary => true,
            ConsentCategory::Functional => self.functional,
            ConsentCategory::Analytics => self.analytics,
            ConsentCategory::Marketing => self.marketing,
        }
    }

    /// Whether every optional category is granted.
    pub fn all_granted(&self) -> bool {
        self.functional && self.analytics && self.marketing
    }

    /// Whether any optional category is granted.
    pub fn any_optional_granted(&self) -> bool {
        self.functional || self.analytics || self.marketing
    }

    /// Merge in another grant set without ever revoking (monotonic union).
    pub fn merge(&self, other: &CategoryGrants) -> Self {
        Self {
            necessary: true,
            functional: self.functional || other.functional,
            analytics: self.analytics || other.analytics,
            marketing: self.marketing || other.marketing,
        }
    }
}

impl Default for CategoryGrants {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn necessary_is_always_granted() {
        let grants = CategoryGrants::none();
        assert!(grants.granted(ConsentCategory::Necessary));
        assert!(!grants.granted(ConsentCategory::Analytics));
        assert!(!grants.any_optional_granted());
    }

    #[test]
    fn selection_maps_to_grants() {
        let grants = CategoryGrants::from_selection(CategorySelection::new(false, true, false));
        assert!(grants.granted(ConsentCategory::Analytics));
        assert!(!grants.granted(ConsentCategory::Functional));
        assert!(!grants.granted(ConsentCategory::Marketing));
        assert!(!grants.all_granted());
    }

    #[test]
    fn merge_is_monotonic() {
        let a = CategoryGrants::from_selection(CategorySelection::new(true, false, false));
        let b = CategoryGrants::from_selection(CategorySelection::new(false, true, false));
        let merged = a.merge(&b);
        assert!(merged.functional);
        assert!(merged.analytics);
        assert!(!merged.marketing);
    }
}
