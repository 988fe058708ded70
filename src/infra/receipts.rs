//! On-disk transaction receipts
//!
//! One file per confirmed anchor at `<dir>/<tx_hash>.json`, holding the
//! canonical JSON of a [`StoredReceipt`]. The SHA-256 of the file bytes is
//! reported in proof bundles, so files are written once and never rewritten.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::crypto::{canonicalize_json, sha256_hex};
use crate::infra::{LedgerError, Result};

/// Receipt content captured at confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReceipt {
    /// Hex, no `0x`
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: Option<u64>,
    pub success: bool,
    /// Root emitted by the contract event, hex without `0x`
    pub anchored_root: Option<String>,
    pub block_timestamp: Option<u64>,
    /// Receipt as returned by the node
    pub raw: Value,
}

/// A receipt file read back from disk
#[derive(Debug, Clone)]
pub struct ReceiptFile {
    pub bytes: Vec<u8>,
    pub sha256: String,
}

impl ReceiptFile {
    pub fn parse(&self) -> Option<StoredReceipt> {
        serde_json::from_slice(&self.bytes).ok()
    }
}

/// Directory of receipt files
#[derive(Debug, Clone)]
pub struct ReceiptStore {
    dir: PathBuf,
}

impl ReceiptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, tx_hash: &str) -> Result<PathBuf> {
        let tx_hash = tx_hash.strip_prefix("0x").unwrap_or(tx_hash);
        if tx_hash.is_empty() || !tx_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LedgerError::Validation(format!(
                "invalid transaction hash: {tx_hash}"
            )));
        }
        Ok(self.dir.join(format!("{}.json", tx_hash.to_ascii_lowercase())))
    }

    /// Write the receipt unless one already exists; returns the file hash.
    pub async fn write(&self, receipt: &StoredReceipt) -> Result<String> {
        let path = self.path_for(&receipt.tx_hash)?;
        if let Some(existing) = self.read(&receipt.tx_hash).await? {
            return Ok(existing.sha256);
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = canonicalize_json(&serde_json::to_value(receipt)?).into_bytes();
        tokio::fs::write(&path, &bytes).await?;

        tracing::info!(path = %path.display(), "Receipt written");
        Ok(sha256_hex(&bytes))
    }

    pub async fn read(&self, tx_hash: &str) -> Result<Option<ReceiptFile>> {
        let path = self.path_for(tx_hash)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let sha256 = sha256_hex(&bytes);
                Ok(Some(ReceiptFile { bytes, sha256 }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, tx_hash: &str) -> bool {
        match self.path_for(tx_hash) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn receipt(tx: &str) -> StoredReceipt {
        StoredReceipt {
            tx_hash: tx.to_string(),
            block_number: 7,
            log_index: Some(0),
            success: true,
            anchored_root: Some("ab".repeat(32)),
            block_timestamp: Some(1_767_600_000),
            raw: json!({"status": "0x1", "blockNumber": "0x7"}),
        }
    }

    #[tokio::test]
    async fn test_write_is_canonical_and_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiptStore::new(dir.path().join("receipts"));
        let tx = "cd".repeat(32);

        let sha = store.write(&receipt(&tx)).await.unwrap();
        let file = store.read(&tx).await.unwrap().unwrap();
        assert_eq!(file.sha256, sha);
        assert!(file.bytes.starts_with(b"{\"anchored_root\""));
        assert_eq!(file.parse().unwrap(), receipt(&tx));

        let mut changed = receipt(&tx);
        changed.block_number = 8;
        assert_eq!(store.write(&changed).await.unwrap(), sha);
        assert!(store.exists(&format!("0x{tx}")).await);
    }

    #[tokio::test]
    async fn test_rejects_path_like_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiptStore::new(dir.path());
        assert!(store.path_for("../etc/passwd").is_err());
        assert!(store.path_for("").is_err());
        assert!(!store.exists("nope").await);
        assert!(store.read(&"ab".repeat(32)).await.unwrap().is_none());
    }
}
