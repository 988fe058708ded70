//! REST API handlers organized by domain.

pub mod anchors;
pub mod evidence;
pub mod health;
pub mod ledger;
pub mod verification;

pub use anchors::*;
pub use evidence::*;
pub use health::*;
pub use ledger::*;
pub use verification::*;
