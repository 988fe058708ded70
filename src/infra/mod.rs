//! Infrastructure layer for the MRO ledger
//!
//! Contains trait definitions and implementations for:
//! - Ledger event storage (SQLite, in-memory)
//! - The hash-chained append path and chain verification
//! - Daily anchor batching and reconciliation
//! - Receipt files for confirmed anchors
//! - Dead-letter file for failed appends
//! - Retry with exponential backoff

mod batcher;
mod dead_letter;
mod error;
mod ledger;
mod memory;
mod receipts;
mod retry;
pub mod sqlite;
mod traits;

pub use batcher::{
    leaves_from_events, AnchorBatcher, BatchOutcome, DayReport, DayStatus, ReconcileReport,
};
pub use dead_letter::{
    DeadLetterEntry, DeadLetterQueue, DeadLetterStats, ReplayAppender, ReplayReport,
    INVALID_PAYLOAD_JSON,
};
#[cfg(test)]
pub use dead_letter::MockReplayAppender;
pub use error::*;
pub use ledger::{
    verify_chain, verify_chain_from, AppendError, ChainBreak, ChainBreakReason, ChainSummary,
    Ledger, VerifyOutcome, VerifyScope,
};
pub use memory::{MemoryAnchorStore, MemoryKeyRegistry, MemoryLedgerStore};
pub use receipts::{ReceiptFile, ReceiptStore, StoredReceipt};
pub use retry::{RetryPolicy, RetryResult};
pub use sqlite::{SqliteAnchorStore, SqliteKeyRegistry, SqliteLedgerStore};
pub use traits::*;
