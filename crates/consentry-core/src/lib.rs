//! Consentry Core
//!
//! The consent lifecycle engine for a client-side consent-governance layer:
//! it records a visitor's category-level consent decisions, persists and
//! expires them, and broadcasts every applied decision to the components
//! that gate content on the page.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Host Page / Embedder                    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Consentry Core                         │
//! │  ┌──────────────┐  ┌───────────────┐  ┌───────────────────┐  │
//! │  │ Policy Table │→ │ State Machine │→ │ Consent Store     │  │
//! │  │ (categories) │  │ (lifecycle)   │  │ (persist + expiry)│  │
//! │  └──────────────┘  └───────────────┘  └───────────────────┘  │
//! │                           │                                  │
//! │            ┌──────────────┼──────────────┐                   │
//! │            ▼              ▼              ▼                   │
//! │   ┌───────────────┐ ┌───────────┐ ┌──────────────┐          │
//! │   │ Signal Bridge │ │ Event Log │ │ Broadcast Bus│          │
//! │   │ (ad/analytics)│ │ Bridge    │ │ (in-page)    │          │
//! │   └───────────────┘ └───────────┘ └──────────────┘          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Block-by-default**: no grant exists until a decision is applied.
//! - **Expiry**: a record older than the configured lifetime is absent.
//! - **Reconsent**: a record scoped to a different policy configuration is
//!   discarded and a fresh decision is forced.
//! - **Idempotent apply**: re-applying the same record produces no second
//!   round of bridge/bus/audit effects.
//! - **Fail-safe degradation**: storage and remote failures never surface;
//!   the fallback direction is always "more blocked".

pub mod bridge;
pub mod bus;
pub mod category;
pub mod machine;
pub mod policy;
pub mod record;
pub mod remote;
pub mod runtime;
pub mod store;

pub use bridge::*;
pub use bus::*;
pub use category::*;
pub use machine::*;
pub use policy::*;
pub use record::*;
pub use remote::*;
pub use runtime::*;
pub use store::*;

use thiserror::Error;

/// Errors from consent lifecycle operations
#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("remote collaborator error: {0}")]
    Remote(String),

    #[error("invalid consent record: {0}")]
    InvalidRecord(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for consent lifecycle operations
pub type Result<T> = std::result::Result<T, ConsentError>;
