//! Domain models for the MRO ledger
//!
//! Ledger events, anchors, evidence exports and signing key records.

mod anchor;
mod event;
mod evidence;
mod keys;
mod types;

pub use anchor::*;
pub use event::*;
pub use evidence::*;
pub use keys::*;
pub use types::*;
