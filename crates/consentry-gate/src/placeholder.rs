//! Visual placeholders for well-known embeds.
//!
//! A blocked video or map frame is replaced by a placeholder element that
//! carries the provider name and the original (not-yet-fetched) locator,
//! so presentation can render a branded overlay and the engine can swap
//! the real frame back in on grant.

use crate::{ElementSpec, ElementTag};
use consentry_core::{EmbedKind, EmbedProvider};
use std::collections::BTreeMap;

/// Marker attribute identifying a placeholder; value is the provider name.
pub const PLACEHOLDER_ATTR: &str = "data-consent-placeholder";
/// Stashed original locator on the placeholder.
pub const PLACEHOLDER_SRC_ATTR: &str = "data-consent-href";

/// Build the placeholder element for a blocked embed.
pub fn placeholder_for(provider: &EmbedProvider, original_locator: &str) -> ElementSpec {
    let kind_class = match provider.kind {
        EmbedKind::Video => "consentry-placeholder--video",
        EmbedKind::Map => "consentry-placeholder--map",
    };
    ElementSpec::new(ElementTag::Other("div".into()))
        .attr(PLACEHOLDER_ATTR, &provider.name)
        .attr(PLACEHOLDER_SRC_ATTR, original_locator)
        .attr("class", &format!("consentry-placeholder {kind_class}"))
}

/// Whether an attribute map belongs to a placeholder element.
pub fn is_placeholder(attrs: &BTreeMap<String, String>) -> bool {
    attrs.contains_key(PLACEHOLDER_ATTR)
}

/// Append a query directive to a locator unless it is already present.
/// Used to add the autoplay directive when restoring a video placeholder.
pub fn with_param(locator: &str, param: &str) -> String {
    if locator.contains(param) {
        return locator.to_string();
    }
    let separator = if locator.contains('?') { '&' } else { '?' };
    format!("{locator}{separator}{param}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn youtube() -> EmbedProvider {
        EmbedProvider {
            name: "youtube".into(),
            kind: EmbedKind::Video,
            patterns: vec!["*.youtube.com".into()],
            autoplay_param: Some("autoplay=1".into()),
        }
    }

    #[test]
    fn placeholder_carries_provider_and_locator() {
        let spec = placeholder_for(&youtube(), "https://www.youtube.com/embed/abc");
        assert_eq!(spec.attrs.get(PLACEHOLDER_ATTR).unwrap(), "youtube");
        assert_eq!(
            spec.attrs.get(PLACEHOLDER_SRC_ATTR).unwrap(),
            "https://www.youtube.com/embed/abc"
        );
        assert!(is_placeholder(&spec.attrs));
    }

    #[test]
    fn with_param_appends_once() {
        assert_eq!(
            with_param("https://v.example/embed/1", "autoplay=1"),
            "https://v.example/embed/1?autoplay=1"
        );
        assert_eq!(
            with_param("https://v.example/embed/1?rel=0", "autoplay=1"),
            "https://v.example/embed/1?rel=0&autoplay=1"
        );
        assert_eq!(
            with_param("https://v.example/embed/1?autoplay=1", "autoplay=1"),
            "https://v.example/embed/1?autoplay=1"
        );
    }
}
