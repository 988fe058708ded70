//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use mro_ledger::anchor::{
    AnchorCall, AnchorConfig, AnchorPublisher, ChainClient, ChainError, ChainReceipt,
};
use mro_ledger::crypto::ExportSigningKey;
use mro_ledger::domain::FixedClock;
use mro_ledger::evidence::{EvidenceService, ExportSigner, SigningKeyCache};
use mro_ledger::infra::{
    AnchorBatcher, DeadLetterQueue, Ledger, MemoryAnchorStore, MemoryKeyRegistry,
    MemoryLedgerStore, ReceiptStore, RetryPolicy,
};
use mro_ledger::metrics::MetricsRegistry;
use mro_ledger::server::AppState;
use mro_ledger::verification::{
    AccessPolicy, AllowAll, NoopAuthzRegistry, VerificationAggregator,
};

/// The day all fixture events are written on
pub fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
}

pub fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap()
}

/// Fully configured anchoring; the chain itself is always [`FakeChain`].
pub fn anchor_config() -> AnchorConfig {
    AnchorConfig {
        publish_enabled: true,
        rpc_url: Some("http://127.0.0.1:8545".into()),
        chain_id: Some(11155111),
        contract_address: Some("0x5FbDB2315678afecb367f032d93F642f64180aa3".into()),
        private_key: Some(
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".into(),
        ),
        network: "sepolia".into(),
        confirm_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(10),
        drop_window: Duration::from_secs(600),
        publish_lease: Duration::from_secs(300),
    }
}

pub fn inspection_transition(entity_id: &str, from: Option<&str>, to: &str) -> Value {
    let mut payload = json!({
        "entity_type": "inspection",
        "entity_id": entity_id,
        "to_status": to,
    });
    if let Some(from) = from {
        payload["from_status"] = json!(from);
    }
    payload
}

pub fn tmc_movement(item: &str, qty: i64) -> Value {
    json!({
        "entity_type": "tmc_item",
        "entity_id": item,
        "movement": "issue",
        "quantity": qty,
        "from_location": "stores-A",
        "to_location": "hangar-2",
    })
}

// ============================================================================
// Fake chain
// ============================================================================

/// In-process chain: every submitted call is mined on the next receipt poll
/// and emits `RootAnchored` with the submitted root.
#[derive(Default)]
pub struct FakeChain {
    submitted: Mutex<HashMap<String, AnchorCall>>,
    reverted: Mutex<bool>,
    submit_delay: Duration,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain whose `submit_anchor` takes `delay` before answering
    pub fn slow(delay: Duration) -> Self {
        Self {
            submit_delay: delay,
            ..Self::default()
        }
    }

    /// Make every subsequent receipt report a reverted transaction
    pub fn revert_all(&self) {
        *self.reverted.lock().unwrap() = true;
    }

    pub fn submissions(&self) -> Vec<AnchorCall> {
        self.submitted.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn submit_anchor(&self, call: &AnchorCall) -> Result<String, ChainError> {
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        let mut submitted = self.submitted.lock().unwrap();
        let tx_hash = format!("{:064x}", submitted.len() + 1);
        submitted.insert(tx_hash.clone(), call.clone());
        Ok(tx_hash)
    }

    async fn fetch_receipt(&self, tx_hash: &str) -> Result<Option<ChainReceipt>, ChainError> {
        let submitted = self.submitted.lock().unwrap();
        let Some(call) = submitted.get(tx_hash) else {
            return Ok(None);
        };
        let success = !*self.reverted.lock().unwrap();
        Ok(Some(ChainReceipt {
            tx_hash: tx_hash.to_string(),
            block_number: 7_000_000,
            success,
            log_index: success.then_some(0),
            anchored_root: success.then_some(call.root),
            block_timestamp: Some(call.period_end + 3_600),
            raw: json!({ "transactionHash": format!("0x{tx_hash}"), "status": success }),
        }))
    }
}

// ============================================================================
// In-memory application harness
// ============================================================================

pub struct Harness {
    pub state: AppState,
    pub events: Arc<MemoryLedgerStore>,
    pub anchors: Arc<MemoryAnchorStore>,
    pub keys: Arc<MemoryKeyRegistry>,
    pub chain: Arc<FakeChain>,
    pub clock: FixedClock,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Arc::new(AllowAll), 100, anchor_config())
    }

    pub fn with(policy: Arc<dyn AccessPolicy>, rate_limit: u32, anchor: AnchorConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::new(morning());
        let events = Arc::new(MemoryLedgerStore::new());
        let anchors = Arc::new(MemoryAnchorStore::new());
        let keys = Arc::new(MemoryKeyRegistry::new());
        let chain = Arc::new(FakeChain::new());

        let ledger = Arc::new(
            Ledger::new(events.clone())
                .with_clock(Arc::new(clock.clone()))
                .with_retry_policy(RetryPolicy::immediate(2))
                .with_dead_letters(Arc::new(DeadLetterQueue::new(
                    dir.path().join("dead-letter.ndjson"),
                ))),
        );
        let publisher = Arc::new(
            AnchorPublisher::new(
                anchor,
                anchors.clone(),
                events.clone(),
                ReceiptStore::new(dir.path().join("receipts")),
            )
            .with_chain_client(chain.clone())
            .with_clock(Arc::new(clock.clone())),
        );
        let signer = ExportSigner::new(ExportSigningKey::generate());
        let evidence = Arc::new(
            EvidenceService::new(
                events.clone(),
                keys.clone(),
                Arc::new(SigningKeyCache::with_signer(signer)),
            )
            .with_clock(Arc::new(clock.clone())),
        );
        let metrics = Arc::new(MetricsRegistry::new());
        let verification = Arc::new(VerificationAggregator::new(
            ledger.clone(),
            Arc::new(NoopAuthzRegistry),
            policy.clone(),
            rate_limit,
            metrics.clone(),
        ));

        let state = AppState {
            ledger,
            anchors: anchors.clone(),
            publisher,
            evidence,
            verification,
            policy,
            metrics,
        };

        Self {
            state,
            events,
            anchors,
            keys,
            chain,
            clock,
            dir,
        }
    }

    pub fn batcher(&self) -> AnchorBatcher {
        AnchorBatcher::new(
            self.events.clone(),
            self.anchors.clone(),
            ReceiptStore::new(self.dir.path().join("receipts")),
        )
        .with_clock(Arc::new(self.clock.clone()))
    }
}
