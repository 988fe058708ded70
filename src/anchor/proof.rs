//! Offline proofs for anchors: proof bundles, anchor detail and event inclusion
//!
//! Everything here is computed from stored rows, the ledger store and the
//! receipt file. No chain calls are made.

use serde::Serialize;
use serde_json::Value;

use crate::crypto::{hash_from_hex, verify_merkle_proof, MerkleTree};
use crate::domain::{format_timestamp, parse_timestamp, Anchor, AnchorPeriod};
use crate::infra::{leaves_from_events, verify_chain_from, LedgerError, Result};

use super::AnchorPublisher;

/// Producer of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

impl ToolInfo {
    fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnchainInfo {
    pub network: Option<String>,
    pub chain_id: Option<i64>,
    pub contract_address: Option<String>,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub log_index: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptInfo {
    pub available: bool,
    pub sha256: Option<String>,
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofVerification {
    pub merkle_ok: bool,
    pub onchain_event_ok: bool,
    pub signature_chain_ok: bool,
    pub notes: Vec<String>,
}

/// Self-contained evidence that an anchor covers its period's events.
///
/// `anchor_detail` returns the same shape without `tool` and `leaves`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofBundle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolInfo>,
    pub generated_at: String,
    pub anchor: Anchor,
    pub onchain: OnchainInfo,
    /// Sorted hex leaves
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaves: Option<Vec<String>>,
    pub receipt: ReceiptInfo,
    pub verification: ProofVerification,
}

/// Merkle path from one ledger event to its anchor root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InclusionProof {
    pub event_id: i64,
    pub block_hash: String,
    pub anchor_id: i64,
    pub anchor_status: String,
    pub merkle_root: String,
    /// Sibling hashes, leaf to root
    pub path: Vec<String>,
    pub verified: bool,
}

impl AnchorPublisher {
    /// Full proof bundle including tool metadata and the sorted leaves.
    pub async fn build_proof_bundle(&self, anchor_id: i64) -> Result<ProofBundle> {
        self.assemble(anchor_id, true).await
    }

    pub async fn anchor_detail(&self, anchor_id: i64) -> Result<ProofBundle> {
        self.assemble(anchor_id, false).await
    }

    async fn assemble(&self, anchor_id: i64, full: bool) -> Result<ProofBundle> {
        let anchor = self
            .anchors
            .get(anchor_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("anchor", anchor_id))?;

        let mut verification = ProofVerification::default();
        let events = self.events.in_period(&anchor.period()).await?;
        let tree = MerkleTree::from_leaves(&leaves_from_events(&events)?);

        let recomputed = tree.root().map(hex::encode);
        verification.merkle_ok = recomputed == anchor.merkle_root;
        if !verification.merkle_ok {
            verification.notes.push(format!(
                "recomputed root {} differs from anchor root {}",
                recomputed.as_deref().unwrap_or("none"),
                anchor.merkle_root.as_deref().unwrap_or("none")
            ));
        }
        if events.len() as i64 != anchor.events_count {
            verification.notes.push(format!(
                "period holds {} events, anchor recorded {}",
                events.len(),
                anchor.events_count
            ));
        }

        verification.signature_chain_ok = match (events.first(), events.last()) {
            (Some(first), Some(last)) => {
                let chain = self.events.range(Some(first.id), Some(last.id)).await?;
                let predecessor = self.events.predecessor(first.id).await?;
                let expected_prev = predecessor.as_ref().map(|p| p.block_hash.as_str());
                match verify_chain_from(&chain, expected_prev) {
                    Ok(_) => true,
                    Err(chain_break) => {
                        verification.notes.push(format!(
                            "{chain_break} (event {}, {})",
                            chain_break.event_id, chain_break.reason
                        ));
                        false
                    }
                }
            }
            _ => true,
        };

        let receipt = self.receipt_info(&anchor).await?;
        verification.onchain_event_ok =
            onchain_event_ok(&anchor, &receipt, &mut verification.notes);

        Ok(ProofBundle {
            tool: full.then(ToolInfo::current),
            generated_at: format_timestamp(self.clock.now()),
            onchain: OnchainInfo {
                network: anchor.network.clone(),
                chain_id: anchor.chain_id,
                contract_address: anchor.contract_address.clone(),
                tx_hash: anchor.tx_hash.clone(),
                block_number: anchor.block_number,
                log_index: anchor.log_index,
            },
            leaves: full.then(|| tree.leaves().iter().map(hex::encode).collect()),
            anchor,
            receipt,
            verification,
        })
    }

    async fn receipt_info(&self, anchor: &Anchor) -> Result<ReceiptInfo> {
        let file = match anchor.tx_hash.as_deref() {
            Some(tx_hash) => self.receipts.read(tx_hash).await?,
            None => None,
        };
        Ok(match file {
            Some(file) => ReceiptInfo {
                available: true,
                content: serde_json::from_slice(&file.bytes).ok(),
                sha256: Some(file.sha256),
            },
            None => ReceiptInfo {
                available: false,
                sha256: None,
                content: None,
            },
        })
    }

    /// Merkle path proving that ledger event `event_id` is covered by its day's anchor.
    pub async fn event_inclusion(&self, event_id: i64) -> Result<InclusionProof> {
        let event = self
            .events
            .get(event_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("event", event_id))?;
        let created_at = parse_timestamp(&event.created_at).ok_or_else(|| {
            LedgerError::Internal(format!("event {event_id} has a malformed created_at"))
        })?;

        let period = AnchorPeriod::for_day(created_at.date_naive());
        let anchor = self
            .anchors
            .live_for_period(&period)
            .await?
            .ok_or_else(|| LedgerError::not_found("anchor for period", period.to_string()))?;
        let merkle_root = anchor.merkle_root.clone().ok_or_else(|| {
            LedgerError::Internal(format!("anchor {} has no merkle root", anchor.id))
        })?;

        let leaf = hash_from_hex(&event.block_hash).ok_or_else(|| {
            LedgerError::Internal(format!("event {event_id} has a malformed block_hash"))
        })?;
        let events = self.events.in_period(&period).await?;
        let tree = MerkleTree::from_leaves(&leaves_from_events(&events)?);
        let path = tree.proof(&leaf).ok_or_else(|| {
            LedgerError::Internal(format!("event {event_id} missing from its period tree"))
        })?;

        let verified = hash_from_hex(&merkle_root)
            .map(|root| verify_merkle_proof(&leaf, &path, &root))
            .unwrap_or(false);

        Ok(InclusionProof {
            event_id,
            block_hash: event.block_hash,
            anchor_id: anchor.id,
            anchor_status: anchor.status.to_string(),
            merkle_root,
            path: path.iter().map(hex::encode).collect(),
            verified,
        })
    }
}

fn onchain_event_ok(anchor: &Anchor, receipt: &ReceiptInfo, notes: &mut Vec<String>) -> bool {
    let Some(tx_hash) = anchor.tx_hash.as_deref() else {
        notes.push("anchor has not been published".to_string());
        return false;
    };
    if !receipt.available {
        notes.push(format!("receipt for tx {tx_hash} is not available"));
        return false;
    }
    let Some(stored) = receipt
        .content
        .clone()
        .and_then(|content| serde_json::from_value::<crate::infra::StoredReceipt>(content).ok())
    else {
        notes.push("receipt file is not a stored receipt".to_string());
        return false;
    };

    let mut ok = true;
    if !stored.success {
        notes.push("receipt reports a failed transaction".to_string());
        ok = false;
    }
    if stored.anchored_root.is_none() || stored.anchored_root != anchor.merkle_root {
        notes.push("logged root does not match anchor root".to_string());
        ok = false;
    }
    if !stored.tx_hash.eq_ignore_ascii_case(tx_hash) {
        notes.push("receipt tx_hash does not match anchor".to_string());
        ok = false;
    }
    if anchor.block_number != i64::try_from(stored.block_number).ok() {
        notes.push("receipt block number does not match anchor".to_string());
        ok = false;
    }
    ok
}
