//! Append -> batch -> publish -> confirm -> proof, over memory and SQLite stores

mod common;

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use common::{day, inspection_transition, morning, tmc_movement, FakeChain, Harness};
use mro_ledger::anchor::{AnchorConfig, AnchorPublisher, ConfirmOutcome, PublishError};
use mro_ledger::crypto::{hash_from_hex, verify_merkle_proof};
use mro_ledger::domain::{AnchorStatus, FixedClock};
use mro_ledger::infra::{
    AnchorBatcher, AnchorStore, BatchOutcome, DayStatus, Ledger, LedgerStore, ReceiptStore,
};
use mro_ledger::server::Stores;

async fn append_day(harness: &Harness) {
    let ledger = &harness.state.ledger;
    ledger
        .append(
            "inspection.transition",
            inspection_transition("INSP-100", None, "open"),
            Some(1),
        )
        .await
        .unwrap();
    ledger
        .append("tmc.movement", tmc_movement("TMC-100", 4), Some(2))
        .await
        .unwrap();
    ledger
        .append(
            "user.changed",
            json!({ "entity_type": "user", "entity_id": 9, "action": "role_granted" }),
            None,
        )
        .await
        .unwrap();
    ledger
        .append(
            "inspection.transition",
            inspection_transition("INSP-100", Some("open"), "closed"),
            Some(1),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_full_anchoring_flow() {
    let harness = Harness::new();
    append_day(&harness).await;

    let outcome = harness.batcher().run_period(day()).await.unwrap();
    let BatchOutcome::Created(anchor) = outcome else {
        panic!("expected a new anchor");
    };
    assert_eq!(anchor.status, AnchorStatus::Pending);
    assert_eq!(anchor.events_count, 4);
    assert!(anchor.merkle_root.is_some());

    // Second run is a no-op
    let again = harness.batcher().run_period(day()).await.unwrap();
    assert!(matches!(again, BatchOutcome::AlreadyAnchored(ref a) if a.id == anchor.id));

    let publisher = &harness.state.publisher;
    let published = publisher.publish(anchor.id).await.unwrap();
    assert!(published.anchor.is_submitted());
    assert_eq!(published.anchor.network.as_deref(), Some("sepolia"));

    let submissions = harness.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].event_count, 4);
    assert_eq!(
        Some(hex::encode(submissions[0].root)),
        anchor.merkle_root.clone()
    );
    assert_eq!(
        submissions[0].period_end - submissions[0].period_start,
        86_400
    );

    let confirmed = publisher.confirm(anchor.id).await.unwrap();
    let ConfirmOutcome::Confirmed(confirmed) = confirmed else {
        panic!("expected confirmation, got {confirmed:?}");
    };
    assert_eq!(confirmed.status, AnchorStatus::Confirmed);
    assert_eq!(confirmed.block_number, Some(7_000_000));
    assert!(confirmed.anchored_at.is_some());

    let repeat = publisher.confirm(anchor.id).await.unwrap();
    assert!(matches!(repeat, ConfirmOutcome::AlreadyConfirmed(_)));

    let bundle = publisher.build_proof_bundle(anchor.id).await.unwrap();
    assert!(bundle.verification.merkle_ok, "{:?}", bundle.verification.notes);
    assert!(bundle.verification.onchain_event_ok, "{:?}", bundle.verification.notes);
    assert!(bundle.verification.signature_chain_ok);
    assert!(bundle.receipt.available);
    assert_eq!(bundle.leaves.as_ref().map(Vec::len), Some(4));
    assert!(bundle.tool.is_some());

    let root = hash_from_hex(confirmed.merkle_root.as_deref().unwrap()).unwrap();
    for event_id in 1..=4 {
        let inclusion = publisher.event_inclusion(event_id).await.unwrap();
        assert!(inclusion.verified);
        let leaf = hash_from_hex(&inclusion.block_hash).unwrap();
        let path: Vec<_> = inclusion
            .path
            .iter()
            .map(|h| hash_from_hex(h).unwrap())
            .collect();
        assert!(verify_merkle_proof(&leaf, &path, &root));
    }
}

#[tokio::test]
async fn test_tampered_event_breaks_proof_bundle() {
    let harness = Harness::new();
    append_day(&harness).await;
    let anchor = harness
        .batcher()
        .run_period(day())
        .await
        .unwrap()
        .anchor()
        .clone();

    harness
        .events
        .tamper(2, |event| {
            event.payload_json = event.payload_json.replace("TMC-100", "TMC-101");
        })
        .await;

    let bundle = harness
        .state
        .publisher
        .build_proof_bundle(anchor.id)
        .await
        .unwrap();
    assert!(!bundle.verification.signature_chain_ok);
    assert!(!bundle.verification.onchain_event_ok);
    assert!(!bundle.verification.notes.is_empty());
}

#[tokio::test]
async fn test_empty_day_cannot_be_published() {
    let harness = Harness::new();
    let outcome = harness.batcher().run_period(day()).await.unwrap();
    let anchor = outcome.anchor();

    assert_eq!(anchor.status, AnchorStatus::Empty);
    assert_eq!(anchor.events_count, 0);
    assert!(anchor.merkle_root.is_none());

    let err = harness.state.publisher.publish(anchor.id).await.unwrap_err();
    assert!(matches!(err, PublishError::InvalidState(_)));
    assert!(harness.chain.submissions().is_empty());
}

#[tokio::test]
async fn test_reverted_anchor_is_rebatched_by_reconcile() {
    let harness = Harness::new();
    append_day(&harness).await;
    let anchor = harness
        .batcher()
        .run_period(day())
        .await
        .unwrap()
        .anchor()
        .clone();

    let publisher = &harness.state.publisher;
    publisher.publish(anchor.id).await.unwrap();
    harness.chain.revert_all();

    let outcome = publisher.confirm(anchor.id).await.unwrap();
    let ConfirmOutcome::Failed(failed) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(failed.failure_reason.as_deref(), Some("transaction reverted"));

    let batcher = harness.batcher();
    let report = batcher.reconcile(day(), day(), false).await.unwrap();
    assert_eq!(report.days[0].status, DayStatus::Failed);
    assert_eq!(report.fixed, 0);

    let report = batcher.reconcile(day(), day(), true).await.unwrap();
    assert_eq!(report.fixed, 1);
    let replacement = report.days[0].fixed_anchor_id.unwrap();
    assert_ne!(replacement, anchor.id);

    let fresh = harness.anchors.get(replacement).await.unwrap().unwrap();
    assert_eq!(fresh.status, AnchorStatus::Pending);
    assert_eq!(fresh.merkle_root, anchor.merkle_root);
    assert!(fresh.tx_hash.is_none());
}

#[tokio::test]
async fn test_missing_receipt_is_reported_as_gap() {
    let harness = Harness::new();
    append_day(&harness).await;
    let anchor_id = harness.batcher().run_period(day()).await.unwrap().anchor().id;

    let publisher = &harness.state.publisher;
    let tx_hash = publisher.publish(anchor_id).await.unwrap().tx_hash;
    publisher.confirm(anchor_id).await.unwrap();

    let report = harness.batcher().reconcile(day(), day(), false).await.unwrap();
    assert_eq!(report.days[0].status, DayStatus::ConfirmedOk);
    assert!(!report.has_gaps());

    let path = publisher.receipts().path_for(&tx_hash).unwrap();
    tokio::fs::remove_file(path).await.unwrap();

    let report = harness.batcher().reconcile(day(), day(), false).await.unwrap();
    assert_eq!(report.days[0].status, DayStatus::ConfirmedReceiptMissing);
    assert!(report.has_gaps());

    let bundle = publisher.build_proof_bundle(anchor_id).await.unwrap();
    assert!(bundle.verification.merkle_ok);
    assert!(!bundle.receipt.available);
    assert!(!bundle.verification.onchain_event_ok);
}

#[tokio::test]
async fn test_unmined_transaction_stays_pending_then_drops() {
    let harness = Harness::new();
    append_day(&harness).await;
    let anchor_id = harness.batcher().run_period(day()).await.unwrap().anchor().id;
    harness.state.publisher.publish(anchor_id).await.unwrap();

    // A chain that never saw the transaction
    let clock = FixedClock::new(morning());
    let unmined = AnchorPublisher::new(
        AnchorConfig {
            confirm_timeout: std::time::Duration::from_millis(50),
            ..common::anchor_config()
        },
        harness.anchors.clone(),
        harness.events.clone(),
        ReceiptStore::new(harness.dir.path().join("receipts")),
    )
    .with_chain_client(Arc::new(FakeChain::new()))
    .with_clock(Arc::new(clock.clone()));

    let outcome = unmined.confirm(anchor_id).await.unwrap();
    assert!(matches!(outcome, ConfirmOutcome::StillPending(_)));

    clock.advance(Duration::hours(1));
    let outcome = unmined.confirm(anchor_id).await.unwrap();
    let ConfirmOutcome::Failed(anchor) = outcome else {
        panic!("expected drop, got {outcome:?}");
    };
    assert_eq!(anchor.failure_reason.as_deref(), Some("transaction dropped"));
}

fn rival_publisher(
    anchors: Arc<dyn AnchorStore>,
    events: Arc<dyn LedgerStore>,
    chain: Arc<FakeChain>,
    receipts: std::path::PathBuf,
) -> AnchorPublisher {
    AnchorPublisher::new(common::anchor_config(), anchors, events, ReceiptStore::new(receipts))
        .with_chain_client(chain)
        .with_clock(Arc::new(FixedClock::new(morning())))
}

#[tokio::test]
async fn test_concurrent_publishers_send_one_transaction() {
    let harness = Harness::new();
    append_day(&harness).await;
    let anchor_id = harness.batcher().run_period(day()).await.unwrap().anchor().id;

    let chain = Arc::new(FakeChain::slow(std::time::Duration::from_millis(50)));
    let receipts = harness.dir.path().join("receipts");
    let first = rival_publisher(
        harness.anchors.clone(),
        harness.events.clone(),
        chain.clone(),
        receipts.clone(),
    );
    let second = rival_publisher(
        harness.anchors.clone(),
        harness.events.clone(),
        chain.clone(),
        receipts,
    );

    let (a, b) = tokio::join!(first.publish(anchor_id), second.publish(anchor_id));
    let (won, lost) = match (a, b) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        other => panic!("expected exactly one publish to win, got {other:?}"),
    };
    assert!(matches!(lost, PublishError::InvalidState(_)));
    assert_eq!(chain.submissions().len(), 1);

    let stored = harness.anchors.get(anchor_id).await.unwrap().unwrap();
    assert_eq!(stored.tx_hash.as_deref(), Some(won.tx_hash.as_str()));
}

#[tokio::test]
async fn test_sqlite_publishers_cannot_overwrite_settled_anchor() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mro_ledger::infra::sqlite::connect_and_migrate("sqlite::memory:", 1)
        .await
        .unwrap();
    let stores = Stores::sqlite(pool);
    let ledger =
        Ledger::new(stores.events.clone()).with_clock(Arc::new(FixedClock::new(morning())));
    for n in 0..2 {
        ledger
            .append("tmc.movement", tmc_movement(&format!("TMC-{n}"), 1), Some(3))
            .await
            .unwrap();
    }
    let anchor_id = AnchorBatcher::new(
        stores.events.clone(),
        stores.anchors.clone(),
        ReceiptStore::new(dir.path().join("receipts")),
    )
    .with_clock(Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2026, 1, 6, 2, 0, 0).unwrap(),
    )))
    .run_period(day())
    .await
    .unwrap()
    .anchor()
    .id;

    let chain = Arc::new(FakeChain::slow(std::time::Duration::from_millis(50)));
    let first = rival_publisher(
        stores.anchors.clone(),
        stores.events.clone(),
        chain.clone(),
        dir.path().join("receipts"),
    );
    let second = rival_publisher(
        stores.anchors.clone(),
        stores.events.clone(),
        chain.clone(),
        dir.path().join("receipts"),
    );

    let (a, b) = tokio::join!(first.publish(anchor_id), second.publish(anchor_id));
    assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
    assert_eq!(chain.submissions().len(), 1);

    let confirmed = first.confirm(anchor_id).await.unwrap();
    assert!(matches!(confirmed, ConfirmOutcome::Confirmed(_)));

    // A late revert report for the same transaction cannot flip the row
    chain.revert_all();
    let late = second.confirm(anchor_id).await.unwrap();
    assert!(matches!(late, ConfirmOutcome::AlreadyConfirmed(_)));

    let tx_hash = late.anchor().tx_hash.clone().unwrap();
    let refused = stores
        .anchors
        .mark_failed(anchor_id, &tx_hash, "transaction reverted")
        .await;
    assert!(matches!(refused, Err(mro_ledger::infra::LedgerError::InvalidState(_))));

    let stored = stores.anchors.get(anchor_id).await.unwrap().unwrap();
    assert_eq!(stored.status, AnchorStatus::Confirmed);
    assert!(stored.failure_reason.is_none());
}

#[tokio::test]
async fn test_sqlite_stores_anchor_and_reconcile() {
    let dir = tempfile::tempdir().unwrap();
    let pool = mro_ledger::infra::sqlite::connect_and_migrate("sqlite::memory:", 1)
        .await
        .unwrap();
    let stores = Stores::sqlite(pool);
    let clock = FixedClock::new(morning());

    let ledger = Ledger::new(stores.events.clone()).with_clock(Arc::new(clock.clone()));
    let mut hashes = Vec::new();
    for n in 0..3 {
        hashes.push(
            ledger
                .append("tmc.movement", tmc_movement(&format!("TMC-{n}"), n + 1), Some(3))
                .await
                .unwrap(),
        );
    }
    let outcome = ledger.verify(None, None).await.unwrap();
    assert!(outcome.ok);

    let stored = stores.events.range(None, None).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[1].prev_hash.as_deref(), Some(hashes[0].as_str()));

    let batcher = AnchorBatcher::new(
        stores.events.clone(),
        stores.anchors.clone(),
        ReceiptStore::new(dir.path().join("receipts")),
    )
    .with_clock(Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2026, 1, 8, 2, 0, 0).unwrap(),
    )));

    let from = day() - Duration::days(1);
    let to = day() + Duration::days(1);
    let report = batcher.reconcile(from, to, false).await.unwrap();
    assert_eq!(report.count(DayStatus::Missing), 3);
    assert!(report.has_gaps());

    let report = batcher.reconcile(from, to, true).await.unwrap();
    assert_eq!(report.fixed, 3);

    let report = batcher.reconcile(from, to, false).await.unwrap();
    assert!(!report.has_gaps());
    assert_eq!(report.count(DayStatus::Empty), 2);
    assert_eq!(report.count(DayStatus::PendingNoTx), 1);

    let pending = stores
        .anchors
        .live_for_period(&mro_ledger::domain::AnchorPeriod::for_day(day()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.events_count, 3);
}
