//! Error types for ledger infrastructure

use thiserror::Error;

use crate::domain::Anchor;

/// Errors that can occur in the ledger stores and infrastructure
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The chain tail moved between read and insert
    #[error("ledger tail moved during append")]
    Contention,

    /// Input rejected before any write
    #[error("validation error: {0}")]
    Validation(String),

    /// Row not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A live anchor already covers this period
    #[error("anchor already exists for period {period_start}..{period_end}")]
    DuplicatePeriod {
        period_start: String,
        period_end: String,
    },

    /// A guarded state transition found the row in another state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Contention => true,
            Self::Io(_) => true,
            Self::Database(err) => is_retryable_db_error(err),
            _ => false,
        }
    }
}

/// Refusal for a guarded anchor transition that found the row elsewhere
pub fn transition_refused(anchor: &Anchor, transition: &str) -> LedgerError {
    LedgerError::InvalidState(format!(
        "anchor {} cannot be {transition}: status {}, tx {}",
        anchor.id,
        anchor.status,
        anchor.tx_hash.as_deref().unwrap_or("none")
    ))
}

/// Check if a database error is retryable
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
            code == "5" || code == "6" || code == "261" || code == "517" || code == "262"
        }
        _ => false,
    }
}

/// Result type for ledger infrastructure operations
pub type Result<T> = std::result::Result<T, LedgerError>;
