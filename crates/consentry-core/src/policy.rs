//! Category Policy Table
//!
//! Static mapping of consent categories to domain/pattern lists, plus the
//! well-known embed providers (video/map) that get a visual placeholder
//! instead of a bare blocked frame. Loaded once, immutable for the page
//! lifetime; its hash is the `config_version` consent records are scoped to.

use crate::ConsentCategory;
use blake3::Hasher;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Domain patterns belonging to one consent category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryPolicy {
    pub category: ConsentCategory,
    /// Patterns: exact host, `*.suffix`, interior glob (`cdn*.example.com`),
    /// or host-plus-path-prefix (`google.com/maps`).
    pub domain_patterns: Vec<String>,
}

/// A service declared by the site configuration. Read-only to the core:
/// used to label UI and to resolve explicit opt-in attributes to a category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub key: String,
    pub category: ConsentCategory,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub cookies: Vec<String>,
}

/// What kind of content a known embed provider serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedKind {
    Video,
    Map,
}

/// Placeholder metadata for a well-known embed provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedProvider {
    pub name: String,
    pub kind: EmbedKind,
    pub patterns: Vec<String>,
    /// Query directive appended to the locator when restoring a video
    /// placeholder, so playback starts without a second click.
    pub autoplay_param: Option<String>,
}

/// The static policy table: category patterns, embed providers, declared
/// services.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: Vec<CategoryPolicy>,
    embeds: Vec<EmbedProvider>,
    services: BTreeMap<String, ServiceDescriptor>,
}

impl PolicyTable {
    /// The built-in table of well-known third-party domains.
    pub fn builtin() -> Self {
        let policies = vec![
            CategoryPolicy {
                category: ConsentCategory::Functional,
                domain_patterns: vec![
                    "*.youtube.com".into(),
                    "*.youtube-nocookie.com".into(),
                    "*.vimeo.com".into(),
                    "*.dailymotion.com".into(),
                    "maps.google.com".into(),
                    "google.com/maps".into(),
                    "maps.googleapis.com".into(),
                    "*.openstreetmap.org".into(),
                ],
            },
            CategoryPolicy {
                category: ConsentCategory::Analytics,
                domain_patterns: vec![
                    "*.google-analytics.com".into(),
                    "*.googletagmanager.com".into(),
                    "*.hotjar.com".into(),
                    "*.clarity.ms".into(),
                    "*.mixpanel.com".into(),
                    "*.matomo.cloud".into(),
                    "*.segment.com".into(),
                    "*.plausible.io".into(),
                ],
            },
            CategoryPolicy {
                category: ConsentCategory::Marketing,
                domain_patterns: vec![
                    "*.doubleclick.net".into(),
                    "*.googlesyndication.com".into(),
                    "*.googleadservices.com".into(),
                    "connect.facebook.net".into(),
                    "*.facebook.com".into(),
                    "*.ads-twitter.com".into(),
                    "*.criteo.com".into(),
                    "*.taboola.com".into(),
                    "*.outbrain.com".into(),
                    "*.adnxs.com".into(),
                ],
            },
        ];

        let embeds = vec![
            EmbedProvider {
                name: "youtube".into(),
                kind: EmbedKind::Video,
                patterns: vec!["*.youtube.com".into(), "*.youtube-nocookie.com".into()],
                autoplay_param: Some("autoplay=1".into()),
            },
            EmbedProvider {
                name: "vimeo".into(),
                kind: EmbedKind::Video,
                patterns: vec!["*.vimeo.com".into()],
                autoplay_param: Some("autoplay=1".into()),
            },
            EmbedProvider {
                name: "dailymotion".into(),
                kind: EmbedKind::Video,
                patterns: vec!["*.dailymotion.com".into()],
                autoplay_param: Some("autoplay=1".into()),
            },
            EmbedProvider {
                name: "google-maps".into(),
                kind: EmbedKind::Map,
                patterns: vec![
                    "maps.google.com".into(),
                    "google.com/maps".into(),
                    "*.google.com/maps".into(),
                ],
                autoplay_param: None,
            },
            EmbedProvider {
                name: "openstreetmap".into(),
                kind: EmbedKind::Map,
                patterns: vec!["*.openstreetmap.org".into()],
                autoplay_param: None,
            },
        ];

        Self {
            policies,
            embeds,
            services: BTreeMap::new(),
        }
    }

    /// An empty table (tests, fully site-driven configurations).
    pub fn empty() -> Self {
        Self {
            policies: Vec::new(),
            embeds: Vec::new(),
            services: BTreeMap::new(),
        }
    }

    /// Merge site-declared services into the table. Service declarations
    /// participate in the config hash, so adding or removing one forces
    /// reconsent.
    pub fn with_services<I>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = ServiceDescriptor>,
    {
        for service in services {
            self.services.insert(service.key.clone(), service);
        }
        self
    }

    /// Add a category policy (site-specific extensions).
    pub fn with_policy(mut self, policy: CategoryPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Look up a declared service by its opt-in key.
    pub fn service(&self, key: &str) -> Option<&ServiceDescriptor> {
        self.services.get(key)
    }

    /// All declared services.
    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    /// Whether the site declares any service in an optional category.
    /// When it does not, no third-party load needs gating and the state
    /// machine auto-records a reject-all without soliciting the visitor.
    pub fn has_optional_services(&self) -> bool {
        self.services.values().any(|s| s.category.is_optional())
    }

    /// Classify a resource locator against the category patterns.
    /// Returns `None` when nothing matches; out-of-policy resources are
    /// never blocked.
    pub fn classify_url(&self, url: &str) -> Option<ConsentCategory> {
        let (host, path) = split_locator(url)?;
        for policy in &self.policies {
            for pattern in &policy.domain_patterns {
                if matches_pattern(pattern, &host, &path) {
                    return Some(policy.category);
                }
            }
        }
        None
    }

    /// Find the embed provider whose patterns match a locator.
    pub fn embed_for_url(&self, url: &str) -> Option<&EmbedProvider> {
        let (host, path) = split_locator(url)?;
        self.embeds.iter().find(|provider| {
            provider
                .patterns
                .iter()
                .any(|pattern| matches_pattern(pattern, &host, &path))
        })
    }

    /// Stable hash of the disclosed configuration: categories, patterns and
    /// declared services. This is the `config_version` recorded with every
    /// decision; any change to it forces reconsent.
    pub fn config_hash(&self) -> String {
        let mut hasher = Hasher::new();
        for policy in &self.policies {
            hasher.update(policy.category.as_str().as_bytes());
            let mut patterns = policy.domain_patterns.clone();
            patterns.sort();
            for pattern in patterns {
                hasher.update(pattern.as_bytes());
                hasher.update(b"\x00");
            }
        }
        for (key, service) in &self.services {
            hasher.update(key.as_bytes());
            hasher.update(service.category.as_str().as_bytes());
            hasher.update(b"\x00");
        }
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

/// Split a locator into lowercase host and path. Accepts absolute
/// (`https://host/path`), protocol-relative (`//host/path`) and bare
/// (`host/path`) forms. Returns `None` for locators without a plausible
/// host (`data:`, `about:blank`, relative paths).
fn split_locator(url: &str) -> Option<(String, String)> {
    let rest = if let Some((scheme, rest)) = url.split_once("//") {
        if !scheme.is_empty() && !scheme.ends_with(':') {
            return None;
        }
        rest
    } else {
        if url.contains(':') || url.starts_with('/') || url.starts_with('.') {
            return None;
        }
        url
    };

    let end = rest.find(['?', '#']).unwrap_or(rest.len());
    let without_query = &rest[..end];
    let (host, path) = match without_query.find('/') {
        Some(idx) => (&without_query[..idx], &without_query[idx..]),
        None => (without_query, ""),
    };
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() || !host.contains('.') {
        return None;
    }
    Some((host.to_lowercase(), path.to_lowercase()))
}

/// Match one pattern against a host (and, for patterns carrying a path
/// component, the path prefix).
fn matches_pattern(pattern: &str, host: &str, path: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let (host_pattern, path_prefix) = match pattern.find('/') {
        Some(idx) => (&pattern[..idx], &pattern[idx..]),
        None => (pattern.as_str(), ""),
    };

    let host_matches = if let Some(suffix) = host_pattern.strip_prefix("*.") {
        host == suffix || host.ends_with(&format!(".{suffix}"))
    } else if host_pattern.contains('*') {
        // Interior glob: compile to an anchored regex.
        let escaped = regex::escape(host_pattern).replace("\\*", ".*");
        match Regex::new(&format!("^{escaped}$")) {
            Ok(re) => re.is_match(host),
            Err(_) => false,
        }
    } else {
        host == host_pattern
    };

    host_matches && (path_prefix.is_empty() || path.starts_with(path_prefix))
}
