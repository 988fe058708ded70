//! Cryptographic utilities for the MRO ledger
//!
//! Provides:
//! - Canonical JSON hashing (RFC 8785) and the domain-separated block hash
//! - Sorted-pair Merkle rollup over block hashes
//! - Ed25519 signing of evidence export hashes

mod hash;
mod merkle;
mod signing;

pub use hash::*;
pub use merkle::*;
pub use signing::*;
