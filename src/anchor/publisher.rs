//! Publishing pending anchors and confirming their transactions

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::crypto::hash_from_hex;
use crate::domain::{
    Anchor, AnchorConfirmation, AnchorStatus, AnchorSubmission, Clock, SystemClock,
};
use crate::infra::{AnchorStore, LedgerError, LedgerStore, ReceiptStore, StoredReceipt};

use super::{
    AlloyChainClient, AnchorCall, AnchorConfig, ChainClient, ChainError, ChainReceipt, Missing,
};

/// Publish failures
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("precondition failed: {0}")]
    Precondition(Missing),

    #[error("anchor not found: {0}")]
    NotFound(i64),

    #[error("invalid anchor state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(LedgerError),
}

impl From<LedgerError> for PublishError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidState(msg) => Self::InvalidState(msg),
            other => Self::Store(other),
        }
    }
}

/// Confirmation failures; a reverted or dropped transaction is an outcome, not an error
#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error("precondition failed: {0}")]
    Precondition(Missing),

    #[error("anchor not found: {0}")]
    NotFound(i64),

    #[error("invalid anchor state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(LedgerError),
}

impl From<LedgerError> for ConfirmError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidState(msg) => Self::InvalidState(msg),
            other => Self::Store(other),
        }
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub anchor: Anchor,
    pub tx_hash: String,
}

/// Result of a confirmation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "anchor", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Confirmed(Anchor),
    /// Reverted or dropped; see `failure_reason`
    Failed(Anchor),
    /// Not mined within the timeout and not yet considered dropped
    StillPending(Anchor),
    AlreadyConfirmed(Anchor),
}

impl ConfirmOutcome {
    pub fn anchor(&self) -> &Anchor {
        match self {
            ConfirmOutcome::Confirmed(anchor)
            | ConfirmOutcome::Failed(anchor)
            | ConfirmOutcome::StillPending(anchor)
            | ConfirmOutcome::AlreadyConfirmed(anchor) => anchor,
        }
    }
}

/// Moves anchors through `pending -> submitted -> confirmed | failed`.
///
/// Only the anchor row and the receipt directory are written; the ledger is
/// read for proofs. Every row change is a guarded transition in the store, so
/// publishers sharing a database never double-send or overwrite a settled anchor.
pub struct AnchorPublisher {
    pub(super) config: AnchorConfig,
    pub(super) anchors: Arc<dyn AnchorStore>,
    pub(super) events: Arc<dyn LedgerStore>,
    pub(super) receipts: ReceiptStore,
    client: Option<Arc<dyn ChainClient>>,
    pub(super) clock: Arc<dyn Clock>,
}

impl AnchorPublisher {
    pub fn new(
        config: AnchorConfig,
        anchors: Arc<dyn AnchorStore>,
        events: Arc<dyn LedgerStore>,
        receipts: ReceiptStore,
    ) -> Self {
        let client = match config.missing_for_confirm() {
            Some(_) => None,
            None => match AlloyChainClient::from_config(&config) {
                Ok(client) => Some(Arc::new(client) as Arc<dyn ChainClient>),
                Err(e) => {
                    tracing::warn!(error = %e, "Chain client unavailable");
                    None
                }
            },
        };

        Self {
            config,
            anchors,
            events,
            receipts,
            client,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_chain_client(mut self, client: Arc<dyn ChainClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AnchorConfig {
        &self.config
    }

    pub fn receipts(&self) -> &ReceiptStore {
        &self.receipts
    }

    fn client(&self) -> Result<&Arc<dyn ChainClient>, ChainError> {
        self.client.as_ref().ok_or_else(|| {
            ChainError::InvalidConfig("chain client could not be built from configuration".into())
        })
    }

    /// Send the anchor's root on-chain and record the transaction.
    pub async fn publish(&self, anchor_id: i64) -> Result<PublishOutcome, PublishError> {
        if let Some(missing) = self.config.missing_for_publish() {
            return Err(PublishError::Precondition(missing));
        }
        let anchor = self
            .anchors
            .get(anchor_id)
            .await?
            .ok_or(PublishError::NotFound(anchor_id))?;

        if anchor.status != AnchorStatus::Pending {
            return Err(PublishError::InvalidState(format!(
                "anchor {anchor_id} is {}",
                anchor.status
            )));
        }
        if let Some(tx_hash) = &anchor.tx_hash {
            return Err(PublishError::InvalidState(format!(
                "anchor {anchor_id} already submitted in tx {tx_hash}"
            )));
        }
        let root = anchor
            .merkle_root
            .as_deref()
            .and_then(hash_from_hex)
            .ok_or_else(|| {
                PublishError::InvalidState(format!("anchor {anchor_id} has no merkle root"))
            })?;

        let call = AnchorCall {
            root,
            period_start: anchor.period_start.timestamp().max(0) as u64,
            period_end: anchor.period_end.timestamp().max(0) as u64,
            event_count: u32::try_from(anchor.events_count).map_err(|_| {
                PublishError::InvalidState(format!("anchor {anchor_id} event count out of range"))
            })?,
        };

        let client = self.client()?;

        let now = self.clock.now();
        let lease = chrono::Duration::from_std(self.config.publish_lease)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        self.anchors
            .claim_for_publish(anchor_id, now, now + lease)
            .await?;

        let tx_hash = match client.submit_anchor(&call).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                if let Err(release) = self.anchors.release_claim(anchor_id).await {
                    tracing::warn!(anchor_id, error = %release, "Failed to release publish claim");
                }
                return Err(e.into());
            }
        };

        let submission = AnchorSubmission {
            tx_hash: tx_hash.clone(),
            network: self.config.network.clone(),
            chain_id: self.config.chain_id.unwrap_or_default() as i64,
            contract_address: self.config.contract_address.clone().unwrap_or_default(),
            submitted_at: self.clock.now(),
        };
        let anchor = self.anchors.record_submission(anchor_id, &submission).await?;

        tracing::info!(
            anchor_id,
            tx_hash = %tx_hash,
            network = %submission.network,
            "Anchor published"
        );
        Ok(PublishOutcome { anchor, tx_hash })
    }

    /// Poll for the anchor's receipt and settle its status.
    pub async fn confirm(&self, anchor_id: i64) -> Result<ConfirmOutcome, ConfirmError> {
        let anchor = self
            .anchors
            .get(anchor_id)
            .await?
            .ok_or(ConfirmError::NotFound(anchor_id))?;

        match anchor.status {
            AnchorStatus::Confirmed => return Ok(ConfirmOutcome::AlreadyConfirmed(anchor)),
            AnchorStatus::Pending => {}
            other => {
                return Err(ConfirmError::InvalidState(format!(
                    "anchor {anchor_id} is {other}"
                )))
            }
        }
        if let Some(missing) = self.config.missing_for_confirm() {
            return Err(ConfirmError::Precondition(missing));
        }
        let tx_hash = anchor.tx_hash.clone().ok_or_else(|| {
            ConfirmError::InvalidState(format!("anchor {anchor_id} has not been published"))
        })?;

        let client = self.client()?;
        let polled = tokio::time::timeout(
            self.config.confirm_timeout,
            self.poll_receipt(client.as_ref(), &tx_hash),
        )
        .await;

        let settled = match polled {
            Ok(Ok(receipt)) if receipt.success => {
                self.settle_confirmed(anchor, &tx_hash, receipt).await
            }
            Ok(Ok(_reverted)) => {
                let result = self
                    .anchors
                    .mark_failed(anchor_id, &tx_hash, "transaction reverted")
                    .await;
                if result.is_ok() {
                    tracing::warn!(anchor_id, tx_hash = %tx_hash, "Anchor transaction reverted");
                }
                result.map(ConfirmOutcome::Failed).map_err(ConfirmError::from)
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) => self.settle_unseen(anchor, &tx_hash).await,
        };

        match settled {
            Err(ConfirmError::InvalidState(msg)) => self.settled_elsewhere(anchor_id, msg).await,
            other => other,
        }
    }

    /// A concurrent confirm moved the anchor first; report what it decided.
    async fn settled_elsewhere(
        &self,
        anchor_id: i64,
        msg: String,
    ) -> Result<ConfirmOutcome, ConfirmError> {
        let anchor = self
            .anchors
            .get(anchor_id)
            .await?
            .ok_or(ConfirmError::NotFound(anchor_id))?;
        match anchor.status {
            AnchorStatus::Confirmed => Ok(ConfirmOutcome::AlreadyConfirmed(anchor)),
            _ => Err(ConfirmError::InvalidState(msg)),
        }
    }

    async fn poll_receipt(
        &self,
        client: &dyn ChainClient,
        tx_hash: &str,
    ) -> Result<ChainReceipt, ChainError> {
        loop {
            if let Some(receipt) = client.fetch_receipt(tx_hash).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn settle_unseen(
        &self,
        anchor: Anchor,
        tx_hash: &str,
    ) -> Result<ConfirmOutcome, ConfirmError> {
        let drop_window = chrono::Duration::from_std(self.config.drop_window)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let submitted_at = anchor.submitted_at.unwrap_or(anchor.created_at);

        if submitted_at + drop_window <= self.clock.now() {
            let anchor = self
                .anchors
                .mark_failed(anchor.id, tx_hash, "transaction dropped")
                .await?;
            tracing::warn!(anchor_id = anchor.id, "Anchor transaction dropped");
            return Ok(ConfirmOutcome::Failed(anchor));
        }

        tracing::info!(anchor_id = anchor.id, "Anchor transaction not mined yet");
        Ok(ConfirmOutcome::StillPending(anchor))
    }

    async fn settle_confirmed(
        &self,
        anchor: Anchor,
        tx_hash: &str,
        receipt: ChainReceipt,
    ) -> Result<ConfirmOutcome, ConfirmError> {
        let anchored_root = receipt.anchored_root.map(hex::encode);
        if anchored_root.is_some() && anchored_root != anchor.merkle_root {
            tracing::warn!(
                anchor_id = anchor.id,
                logged_root = anchored_root.as_deref().unwrap_or(""),
                "Logged root differs from anchor root"
            );
        }

        let stored = StoredReceipt {
            tx_hash: tx_hash.to_string(),
            block_number: receipt.block_number,
            log_index: receipt.log_index,
            success: receipt.success,
            anchored_root,
            block_timestamp: receipt.block_timestamp,
            raw: receipt.raw,
        };
        let receipt_sha256 = self.receipts.write(&stored).await?;

        let anchored_at = receipt
            .block_timestamp
            .and_then(|ts| DateTime::<Utc>::from_timestamp(i64::try_from(ts).ok()?, 0))
            .unwrap_or_else(|| self.clock.now());
        let confirmation = AnchorConfirmation {
            block_number: i64::try_from(receipt.block_number).unwrap_or(i64::MAX),
            log_index: receipt.log_index.and_then(|i| i64::try_from(i).ok()),
            anchored_at,
        };
        let anchor = self
            .anchors
            .mark_confirmed(anchor.id, tx_hash, &confirmation)
            .await?;

        tracing::info!(
            anchor_id = anchor.id,
            block_number = confirmation.block_number,
            receipt_sha256 = %receipt_sha256,
            "Anchor confirmed"
        );
        Ok(ConfirmOutcome::Confirmed(anchor))
    }
}
