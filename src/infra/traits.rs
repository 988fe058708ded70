//! Storage traits for the ledger, anchors and the signing key registry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;

use crate::domain::{
    Anchor, AnchorConfirmation, AnchorFilter, AnchorPeriod, AnchorSubmission, KeyRecord,
    LedgerEvent, NewAnchor, NewLedgerEvent, Subject,
};

use super::Result;

/// Append-only storage for hash-chained ledger events.
///
/// Invariant: rows are never updated or deleted.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// The event with the highest id
    async fn tail(&self) -> Result<Option<LedgerEvent>>;

    /// Insert `event` only if its `prev_hash` still matches the tail.
    ///
    /// Returns `LedgerError::Contention` when another writer got there first.
    async fn insert(&self, event: NewLedgerEvent) -> Result<LedgerEvent>;

    /// Read one event by id
    async fn get(&self, id: i64) -> Result<Option<LedgerEvent>>;

    /// Events with ids in `[from_id, to_id]` (either bound optional), ascending
    async fn range(&self, from_id: Option<i64>, to_id: Option<i64>) -> Result<Vec<LedgerEvent>>;

    /// The event immediately preceding `id`
    async fn predecessor(&self, id: i64) -> Result<Option<LedgerEvent>>;

    /// Events whose `created_at` falls in the period, ascending by id
    async fn in_period(&self, period: &AnchorPeriod) -> Result<Vec<LedgerEvent>>;

    /// Events linked to `subject`, ascending by id
    async fn for_subject(&self, subject: &Subject) -> Result<Vec<LedgerEvent>>;
}

/// Storage for period anchors.
///
/// Invariant: at most one anchor per period whose status occupies it
/// (empty, pending or confirmed).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AnchorStore: Send + Sync {
    /// Insert a new anchor; `LedgerError::DuplicatePeriod` if the period is occupied.
    async fn create(&self, anchor: NewAnchor) -> Result<Anchor>;

    async fn get(&self, id: i64) -> Result<Option<Anchor>>;

    /// The anchor currently occupying `period`, if any
    async fn live_for_period(&self, period: &AnchorPeriod) -> Result<Option<Anchor>>;

    /// All anchors (including failed) for `period`, newest first
    async fn for_period(&self, period: &AnchorPeriod) -> Result<Vec<Anchor>>;

    /// Filtered page plus total matching count
    async fn list(&self, filter: &AnchorFilter) -> Result<(Vec<Anchor>, i64)>;

    /// Reserve a pending, unsubmitted anchor for one publisher until `lease_until`.
    ///
    /// `LedgerError::InvalidState` if it is not pending, already carries a
    /// transaction, or another claim is still live at `now`.
    async fn claim_for_publish(
        &self,
        id: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Anchor>;

    /// Drop a claim whose transaction never reached the chain
    async fn release_claim(&self, id: i64) -> Result<()>;

    /// Record the publishing transaction; status stays pending.
    ///
    /// Only a pending anchor without a transaction moves.
    async fn record_submission(&self, id: i64, submission: &AnchorSubmission) -> Result<Anchor>;

    /// Settle as confirmed; the anchor must be pending on `tx_hash`.
    async fn mark_confirmed(
        &self,
        id: i64,
        tx_hash: &str,
        confirmation: &AnchorConfirmation,
    ) -> Result<Anchor>;

    /// Settle as failed; the anchor must be pending on `tx_hash`.
    async fn mark_failed(&self, id: i64, tx_hash: &str, reason: &str) -> Result<Anchor>;
}

/// Registry of export signing public keys.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn get(&self, key_id: &str) -> Result<Option<KeyRecord>>;

    async fn list(&self) -> Result<Vec<KeyRecord>>;

    /// Register a key; registering an existing key id is a no-op.
    async fn register(&self, record: KeyRecord) -> Result<()>;

    /// Make `key_id` the single active key
    async fn activate(&self, key_id: &str) -> Result<()>;

    /// Revoke a key; it stays resolvable so old signatures report `KEY_REVOKED`
    async fn revoke(&self, key_id: &str, reason: &str) -> Result<KeyRecord>;
}
