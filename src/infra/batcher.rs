//! Daily anchor batching and reconciliation
//!
//! A UTC day's block hashes roll up into one sorted Merkle root. Batching is
//! idempotent per day; reconciliation walks a date range and reports (and
//! optionally repairs) days without a usable anchor.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::crypto::{compute_merkle_root, hash_from_hex, Hash256};
use crate::domain::{
    days_inclusive, Anchor, AnchorPeriod, AnchorStatus, Clock, LedgerEvent, NewAnchor,
    SystemClock,
};

use super::{AnchorStore, LedgerError, LedgerStore, ReceiptStore, Result};

/// Decode the block hashes of `events` into Merkle leaves.
pub fn leaves_from_events(events: &[LedgerEvent]) -> Result<Vec<Hash256>> {
    events
        .iter()
        .map(|event| {
            hash_from_hex(&event.block_hash).ok_or_else(|| {
                LedgerError::Internal(format!("event {} has a malformed block_hash", event.id))
            })
        })
        .collect()
}

/// Result of batching one day
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// A live anchor already covered the day
    AlreadyAnchored(Anchor),
    /// A new anchor was written
    Created(Anchor),
}

impl BatchOutcome {
    pub fn anchor(&self) -> &Anchor {
        match self {
            BatchOutcome::AlreadyAnchored(anchor) | BatchOutcome::Created(anchor) => anchor,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, BatchOutcome::Created(_))
    }
}

// ============================================================================
// Reconciliation Report
// ============================================================================

/// Anchoring state of one day
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    Missing,
    Empty,
    PendingNoTx,
    PendingUnconfirmed,
    ConfirmedReceiptMissing,
    ConfirmedOk,
    Failed,
}

impl DayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayStatus::Missing => "missing",
            DayStatus::Empty => "empty",
            DayStatus::PendingNoTx => "pending_no_tx",
            DayStatus::PendingUnconfirmed => "pending_unconfirmed",
            DayStatus::ConfirmedReceiptMissing => "confirmed_receipt_missing",
            DayStatus::ConfirmedOk => "confirmed_ok",
            DayStatus::Failed => "failed",
        }
    }

    /// Re-batching creates a fresh anchor for these
    pub fn is_fixable(&self) -> bool {
        matches!(self, DayStatus::Missing | DayStatus::Failed)
    }
}

/// One row of a reconciliation report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayReport {
    pub day: NaiveDate,
    pub status: DayStatus,
    pub anchor_id: Option<i64>,
    pub tx_hash: Option<String>,
    /// Id of the anchor created by `--fix`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_anchor_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub days: Vec<DayReport>,
    pub counts: BTreeMap<String, usize>,
    pub fixed: usize,
}

impl ReconcileReport {
    /// Days without any anchor, or confirmed anchors whose receipt file is gone
    pub fn has_gaps(&self) -> bool {
        self.days.iter().any(|d| {
            matches!(
                d.status,
                DayStatus::Missing | DayStatus::ConfirmedReceiptMissing
            )
        })
    }

    pub fn count(&self, status: DayStatus) -> usize {
        self.counts.get(status.as_str()).copied().unwrap_or(0)
    }
}

// ============================================================================
// Batcher
// ============================================================================

/// Builds daily anchors from the ledger
pub struct AnchorBatcher {
    events: Arc<dyn LedgerStore>,
    anchors: Arc<dyn AnchorStore>,
    receipts: ReceiptStore,
    clock: Arc<dyn Clock>,
}

impl AnchorBatcher {
    pub fn new(
        events: Arc<dyn LedgerStore>,
        anchors: Arc<dyn AnchorStore>,
        receipts: ReceiptStore,
    ) -> Self {
        Self {
            events,
            anchors,
            receipts,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Anchor the UTC day before "now"
    pub async fn run_previous_day(&self) -> Result<BatchOutcome> {
        self.run_period(AnchorPeriod::previous_day(self.clock.now()).day())
            .await
    }

    /// Create the anchor for `day` unless a live one exists.
    pub async fn run_period(&self, day: NaiveDate) -> Result<BatchOutcome> {
        let period = AnchorPeriod::for_day(day);

        if let Some(existing) = self.anchors.live_for_period(&period).await? {
            tracing::debug!(%day, anchor_id = existing.id, "Period already anchored");
            return Ok(BatchOutcome::AlreadyAnchored(existing));
        }

        let events = self.events.in_period(&period).await?;
        let leaves = leaves_from_events(&events)?;
        let merkle_root = compute_merkle_root(&leaves).map(hex::encode);
        let status = if merkle_root.is_some() {
            AnchorStatus::Pending
        } else {
            AnchorStatus::Empty
        };

        let new_anchor = NewAnchor {
            period,
            events_count: events.len() as i64,
            merkle_root,
            status,
            created_at: self.clock.now(),
        };

        match self.anchors.create(new_anchor).await {
            Ok(anchor) => {
                tracing::info!(
                    %day,
                    anchor_id = anchor.id,
                    events_count = anchor.events_count,
                    status = %anchor.status,
                    merkle_root = anchor.merkle_root.as_deref().unwrap_or(""),
                    "Anchor created"
                );
                Ok(BatchOutcome::Created(anchor))
            }
            Err(LedgerError::DuplicatePeriod { .. }) => {
                // Lost the race to a concurrent batcher
                let winner = self
                    .anchors
                    .live_for_period(&period)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::Internal(format!(
                            "anchor for {day} reported as duplicate but not found"
                        ))
                    })?;
                Ok(BatchOutcome::AlreadyAnchored(winner))
            }
            Err(e) => Err(e),
        }
    }

    async fn classify(&self, period: &AnchorPeriod) -> Result<(DayStatus, Option<Anchor>)> {
        if let Some(anchor) = self.anchors.live_for_period(period).await? {
            let status = match (anchor.status, anchor.tx_hash.as_deref()) {
                (AnchorStatus::Empty, _) => DayStatus::Empty,
                (AnchorStatus::Pending, None) => DayStatus::PendingNoTx,
                (AnchorStatus::Pending, Some(_)) => DayStatus::PendingUnconfirmed,
                (AnchorStatus::Confirmed, Some(tx)) => {
                    if self.receipts.exists(tx).await {
                        DayStatus::ConfirmedOk
                    } else {
                        DayStatus::ConfirmedReceiptMissing
                    }
                }
                (AnchorStatus::Confirmed, None) => DayStatus::ConfirmedReceiptMissing,
                (AnchorStatus::Failed, _) => DayStatus::Failed,
            };
            return Ok((status, Some(anchor)));
        }

        let history = self.anchors.for_period(period).await?;
        Ok(match history.into_iter().next() {
            Some(failed) => (DayStatus::Failed, Some(failed)),
            None => (DayStatus::Missing, None),
        })
    }

    /// Classify every day in `[from, to]`; with `fix`, re-batch missing and failed days.
    pub async fn reconcile(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        fix: bool,
    ) -> Result<ReconcileReport> {
        let mut days = Vec::new();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut fixed = 0;

        for day in days_inclusive(from, to) {
            let period = AnchorPeriod::for_day(day);
            let (status, anchor) = self.classify(&period).await?;
            *counts.entry(status.as_str().to_string()).or_default() += 1;

            let mut fixed_anchor_id = None;
            if fix && status.is_fixable() {
                let outcome = self.run_period(day).await?;
                if outcome.created() {
                    fixed += 1;
                }
                fixed_anchor_id = Some(outcome.anchor().id);
            }

            days.push(DayReport {
                day,
                status,
                anchor_id: anchor.as_ref().map(|a| a.id),
                tx_hash: anchor.and_then(|a| a.tx_hash),
                fixed_anchor_id,
            });
        }

        tracing::info!(
            %from,
            %to,
            days = days.len(),
            fixed,
            "Anchor reconciliation complete"
        );

        Ok(ReconcileReport {
            from,
            to,
            days,
            counts,
            fixed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{merkle_node_hash, sha256};
    use crate::domain::{AnchorConfirmation, AnchorSubmission, FixedClock, NewLedgerEvent};
    use crate::infra::{MemoryAnchorStore, MemoryLedgerStore, StoredReceipt};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        events: Arc<MemoryLedgerStore>,
        anchors: Arc<MemoryAnchorStore>,
        batcher: AnchorBatcher,
        _dir: tempfile::TempDir,
        receipts: ReceiptStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let receipts = ReceiptStore::new(dir.path().join("receipts"));
        let events = Arc::new(MemoryLedgerStore::new());
        let anchors = Arc::new(MemoryAnchorStore::new());
        let batcher = AnchorBatcher::new(events.clone(), anchors.clone(), receipts.clone())
            .with_clock(Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2026, 1, 10, 1, 0, 0).unwrap(),
            )));
        Fixture {
            events,
            anchors,
            batcher,
            _dir: dir,
            receipts,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    async fn add_event(store: &MemoryLedgerStore, n: u8, created_at: &str) -> Hash256 {
        let hash = sha256(&[n]);
        let prev = store.tail().await.unwrap().map(|e| e.block_hash);
        store
            .insert(NewLedgerEvent {
                event_type: "test".into(),
                payload_json: "{}".into(),
                prev_hash: prev,
                block_hash: hex::encode(hash),
                created_at: created_at.into(),
                actor_id: None,
                subject: None,
            })
            .await
            .unwrap();
        hash
    }

    #[tokio::test]
    async fn test_run_period_is_idempotent() {
        let f = fixture();
        let a = add_event(&f.events, 1, "2026-01-05T08:00:00.000000Z").await;
        let b = add_event(&f.events, 2, "2026-01-05T09:00:00.000000Z").await;
        add_event(&f.events, 3, "2026-01-06T00:00:00.000000Z").await;

        let first = f.batcher.run_period(day(5)).await.unwrap();
        assert!(first.created());
        let anchor = first.anchor();
        assert_eq!(anchor.status, AnchorStatus::Pending);
        assert_eq!(anchor.events_count, 2);
        assert_eq!(
            anchor.merkle_root.as_deref(),
            Some(hex::encode(merkle_node_hash(&a, &b)).as_str())
        );

        let second = f.batcher.run_period(day(5)).await.unwrap();
        assert_eq!(second, BatchOutcome::AlreadyAnchored(anchor.clone()));
        assert_eq!(f.anchors.for_period(&AnchorPeriod::for_day(day(5))).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_day_gets_empty_anchor() {
        let f = fixture();
        let outcome = f.batcher.run_period(day(3)).await.unwrap();
        let anchor = outcome.anchor();
        assert_eq!(anchor.status, AnchorStatus::Empty);
        assert_eq!(anchor.merkle_root, None);
        assert_eq!(anchor.events_count, 0);
    }

    #[tokio::test]
    async fn test_single_event_root_is_its_hash() {
        let f = fixture();
        let only = add_event(&f.events, 9, "2026-01-04T12:00:00.000000Z").await;
        let outcome = f.batcher.run_period(day(4)).await.unwrap();
        assert_eq!(outcome.anchor().merkle_root, Some(hex::encode(only)));
    }

    #[tokio::test]
    async fn test_previous_day_uses_clock() {
        let f = fixture();
        let outcome = f.batcher.run_previous_day().await.unwrap();
        assert_eq!(outcome.anchor().period().day(), day(9));
    }

    #[tokio::test]
    async fn test_reconcile_classifies_and_fixes() {
        let f = fixture();
        add_event(&f.events, 1, "2026-01-02T10:00:00.000000Z").await;
        add_event(&f.events, 2, "2026-01-03T10:00:00.000000Z").await;
        add_event(&f.events, 3, "2026-01-04T10:00:00.000000Z").await;
        add_event(&f.events, 4, "2026-01-05T10:00:00.000000Z").await;
        add_event(&f.events, 5, "2026-01-06T10:00:00.000000Z").await;

        // Jan 1: empty. Jan 2: pending, no tx. Jan 3: submitted.
        // Jan 4: confirmed with receipt. Jan 5: confirmed, receipt missing.
        // Jan 6: failed. Jan 7: missing.
        f.batcher.run_period(day(1)).await.unwrap();
        f.batcher.run_period(day(2)).await.unwrap();
        let submitted = |tx: &str| AnchorSubmission {
            tx_hash: tx.to_string(),
            network: "test".into(),
            chain_id: 31337,
            contract_address: "0x01".into(),
            submitted_at: Utc::now(),
        };
        let confirmation = AnchorConfirmation {
            block_number: 1,
            log_index: Some(0),
            anchored_at: Utc::now(),
        };

        let jan3 = f.batcher.run_period(day(3)).await.unwrap();
        f.anchors
            .record_submission(jan3.anchor().id, &submitted(&"03".repeat(32)))
            .await
            .unwrap();

        let jan4 = f.batcher.run_period(day(4)).await.unwrap();
        f.anchors
            .record_submission(jan4.anchor().id, &submitted(&"04".repeat(32)))
            .await
            .unwrap();
        f.anchors
            .mark_confirmed(jan4.anchor().id, &"04".repeat(32), &confirmation)
            .await
            .unwrap();
        f.receipts
            .write(&StoredReceipt {
                tx_hash: "04".repeat(32),
                block_number: 1,
                log_index: Some(0),
                success: true,
                anchored_root: jan4.anchor().merkle_root.clone(),
                block_timestamp: None,
                raw: serde_json::json!({}),
            })
            .await
            .unwrap();

        let jan5 = f.batcher.run_period(day(5)).await.unwrap();
        f.anchors
            .record_submission(jan5.anchor().id, &submitted(&"05".repeat(32)))
            .await
            .unwrap();
        f.anchors
            .mark_confirmed(jan5.anchor().id, &"05".repeat(32), &confirmation)
            .await
            .unwrap();

        let jan6 = f.batcher.run_period(day(6)).await.unwrap();
        f.anchors
            .record_submission(jan6.anchor().id, &submitted(&"06".repeat(32)))
            .await
            .unwrap();
        f.anchors
            .mark_failed(jan6.anchor().id, &"06".repeat(32), "transaction reverted")
            .await
            .unwrap();

        let report = f.batcher.reconcile(day(1), day(7), false).await.unwrap();
        let statuses: Vec<DayStatus> = report.days.iter().map(|d| d.status).collect();
        assert_eq!(
            statuses,
            vec![
                DayStatus::Empty,
                DayStatus::PendingNoTx,
                DayStatus::PendingUnconfirmed,
                DayStatus::ConfirmedOk,
                DayStatus::ConfirmedReceiptMissing,
                DayStatus::Failed,
                DayStatus::Missing,
            ]
        );
        assert!(report.has_gaps());
        assert_eq!(report.fixed, 0);
        assert_eq!(report.count(DayStatus::Missing), 1);

        let fixed = f.batcher.reconcile(day(6), day(7), true).await.unwrap();
        assert_eq!(fixed.fixed, 2);
        assert!(fixed.days.iter().all(|d| d.fixed_anchor_id.is_some()));

        let after = f.batcher.reconcile(day(6), day(7), false).await.unwrap();
        assert!(!after.has_gaps());
        assert_eq!(after.days[0].status, DayStatus::PendingNoTx);
        assert_eq!(after.days[1].status, DayStatus::Empty);
    }

    #[tokio::test]
    async fn test_duplicate_race_reports_winner() {
        use crate::infra::MockAnchorStore;

        let winner = Anchor {
            id: 77,
            period_start: AnchorPeriod::for_day(day(5)).start,
            period_end: AnchorPeriod::for_day(day(5)).end,
            events_count: 0,
            merkle_root: None,
            status: AnchorStatus::Empty,
            network: None,
            chain_id: None,
            contract_address: None,
            tx_hash: None,
            block_number: None,
            log_index: None,
            anchored_at: None,
            created_at: Utc::now(),
            submitted_at: None,
            failure_reason: None,
        };

        let mut anchors = MockAnchorStore::new();
        let mut lookups = 0;
        let found = winner.clone();
        anchors.expect_live_for_period().times(2).returning(move |_| {
            lookups += 1;
            Ok((lookups > 1).then(|| found.clone()))
        });
        anchors.expect_create().times(1).returning(|anchor| {
            let (period_start, period_end) = anchor.period.bounds();
            Err(LedgerError::DuplicatePeriod {
                period_start,
                period_end,
            })
        });

        let dir = tempfile::tempdir().unwrap();
        let batcher = AnchorBatcher::new(
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(anchors),
            ReceiptStore::new(dir.path()),
        );
        let outcome = batcher.run_period(day(5)).await.unwrap();
        assert_eq!(outcome, BatchOutcome::AlreadyAnchored(winner));
    }
}
