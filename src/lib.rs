//! MRO Ledger Library
//!
//! Tamper-evident event ledger for aviation maintenance compliance records:
//! a hash-chained append log, daily Merkle anchoring with optional on-chain
//! publication, and signed evidence exports.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (ledger events, anchors, exports, keys)
//! - [`crypto`] - Canonical hashing, Merkle rollup, Ed25519 export signing
//! - [`infra`] - Stores (SQLite, in-memory), the ledger, batching, dead letters
//! - [`anchor`] - On-chain publication, confirmation and proof bundles
//! - [`evidence`] - Evidence export, signing and verification
//! - [`verification`] - Aggregated authorization and ledger health check
//! - [`metrics`] - Counters and histograms with Prometheus output
//! - [`api`] - REST API routes
//! - [`server`] - HTTP server bootstrap
//! - [`config`] - Environment configuration

pub mod anchor;
pub mod api;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod evidence;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod server;
pub mod verification;

// Re-export commonly used types
pub use domain::{Anchor, AnchorStatus, EvidenceExport, LedgerEvent, Subject};

pub use infra::{AppendError, Ledger, LedgerError, LedgerStore, Result};
