//! Consentry Gate
//!
//! The content gating engine: scans the host tree for network-fetching
//! elements, classifies each against the category policy table,
//! neutralizes the ungranted ones, restores them as consent is granted,
//! and keeps gating elements inserted after initial load.
//!
//! The host tree is modeled abstractly as "a tree plus structural-change
//! notifications" ([`page::HostPage`]); embedders substitute their
//! platform's native change-observation primitive behind that interface.
//! [`page::VirtualPage`] is the reference in-memory implementation.
//!
//! # Guarantees
//!
//! - Blocking is default-on: an element with live fetch capability implies
//!   its category was granted at or before that instant.
//! - Unblocking is monotonic: grants are never withdrawn without a page
//!   reload, and each element is restored exactly once.
//! - Per-element failures are contained: one malformed element never
//!   aborts processing of its siblings.

pub mod engine;
pub mod page;
pub mod placeholder;

pub use engine::*;
pub use page::*;
pub use placeholder::*;

use thiserror::Error;

/// Errors from gating operations on a single element.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("node {0} is no longer in the tree")]
    MissingNode(NodeId),

    #[error("node {node} has no '{name}' attribute")]
    MissingAttribute { node: NodeId, name: String },

    #[error("classification failed: {0}")]
    Classification(String),
}

/// Result type for gating operations
pub type Result<T> = std::result::Result<T, GateError>;
