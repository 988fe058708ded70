//! EVM chain client for publishing anchor roots

use alloy::primitives::{Address, FixedBytes, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::crypto::Hash256;

// Generate contract bindings
sol! {
    #[sol(rpc)]
    interface ILedgerAnchor {
        function anchorRoot(
            bytes32 root,
            uint64 periodStart,
            uint64 periodEnd,
            uint32 eventCount
        ) external;

        event RootAnchored(
            bytes32 indexed root,
            uint64 periodStart,
            uint64 periodEnd,
            uint32 eventCount
        );
    }
}

/// Chain client failures
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid chain configuration: {0}")]
    InvalidConfig(String),

    #[error("transaction submission failed: {0}")]
    Submit(String),

    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Arguments of one `anchorRoot` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorCall {
    pub root: Hash256,
    /// Unix seconds
    pub period_start: u64,
    /// Unix seconds
    pub period_end: u64,
    pub event_count: u32,
}

/// A mined transaction receipt, reduced to what confirmation needs
#[derive(Debug, Clone, PartialEq)]
pub struct ChainReceipt {
    /// Hex, no `0x`
    pub tx_hash: String,
    pub block_number: u64,
    pub success: bool,
    /// Index of the `RootAnchored` log, if emitted
    pub log_index: Option<u64>,
    /// Root carried by the `RootAnchored` log
    pub anchored_root: Option<Hash256>,
    pub block_timestamp: Option<u64>,
    pub raw: Value,
}

/// Transport to the anchoring contract
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Send `anchorRoot`; returns the transaction hash (hex, no `0x`) without waiting.
    async fn submit_anchor(&self, call: &AnchorCall) -> Result<String, ChainError>;

    /// Receipt for `tx_hash`, `None` while unknown or unmined
    async fn fetch_receipt(&self, tx_hash: &str) -> Result<Option<ChainReceipt>, ChainError>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Anchoring settings, read from the environment.
#[derive(Clone)]
pub struct AnchorConfig {
    pub publish_enabled: bool,
    pub rpc_url: Option<String>,
    pub chain_id: Option<u64>,
    pub contract_address: Option<String>,
    /// Hex secp256k1 key for the publishing wallet
    pub private_key: Option<String>,
    /// Label stored on anchors, e.g. `sepolia`
    pub network: String,
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
    /// How long an unseen transaction may stay in flight before it counts as dropped
    pub drop_window: Duration,
    /// How long one publisher holds an anchor while its transaction is sent
    pub publish_lease: Duration,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            publish_enabled: false,
            rpc_url: None,
            chain_id: None,
            contract_address: None,
            private_key: None,
            network: "unknown".to_string(),
            confirm_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            drop_window: Duration::from_secs(30 * 60),
            publish_lease: Duration::from_secs(5 * 60),
        }
    }
}

impl fmt::Debug for AnchorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnchorConfig")
            .field("publish_enabled", &self.publish_enabled)
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("contract_address", &self.contract_address)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("network", &self.network)
            .field("confirm_timeout", &self.confirm_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("drop_window", &self.drop_window)
            .field("publish_lease", &self.publish_lease)
            .finish()
    }
}

/// The first publishing precondition that is not met
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Missing {
    PublishingDisabled,
    RpcUrl,
    ChainId,
    ContractAddress,
    SigningKey,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Missing::PublishingDisabled => "anchor publishing is disabled",
            Missing::RpcUrl => "ANCHOR_RPC_URL is not set",
            Missing::ChainId => "ANCHOR_CHAIN_ID is not set",
            Missing::ContractAddress => "ANCHOR_CONTRACT_ADDRESS is not set",
            Missing::SigningKey => "ANCHOR_PRIVATE_KEY is not set",
        })
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

impl AnchorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            publish_enabled: std::env::var("ANCHOR_PUBLISH_ENABLED")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            rpc_url: env_nonempty("ANCHOR_RPC_URL"),
            chain_id: env_nonempty("ANCHOR_CHAIN_ID").and_then(|s| s.parse().ok()),
            contract_address: env_nonempty("ANCHOR_CONTRACT_ADDRESS"),
            private_key: env_nonempty("ANCHOR_PRIVATE_KEY"),
            network: env_nonempty("ANCHOR_NETWORK").unwrap_or(defaults.network),
            confirm_timeout: env_secs("ANCHOR_CONFIRM_TIMEOUT_SECS", defaults.confirm_timeout),
            poll_interval: env_secs("ANCHOR_POLL_INTERVAL_SECS", defaults.poll_interval),
            drop_window: env_secs("ANCHOR_DROP_WINDOW_SECS", defaults.drop_window),
            publish_lease: env_secs("ANCHOR_PUBLISH_LEASE_SECS", defaults.publish_lease),
        }
    }

    /// First unmet precondition for publishing
    pub fn missing_for_publish(&self) -> Option<Missing> {
        if !self.publish_enabled {
            return Some(Missing::PublishingDisabled);
        }
        self.missing_for_confirm().or_else(|| {
            self.private_key
                .is_none()
                .then_some(Missing::SigningKey)
        })
    }

    /// First unmet precondition for reading receipts
    pub fn missing_for_confirm(&self) -> Option<Missing> {
        if self.rpc_url.is_none() {
            Some(Missing::RpcUrl)
        } else if self.chain_id.is_none() {
            Some(Missing::ChainId)
        } else if self.contract_address.is_none() {
            Some(Missing::ContractAddress)
        } else {
            None
        }
    }
}

// ============================================================================
// Alloy Client
// ============================================================================

/// HTTP JSON-RPC client for the `ILedgerAnchor` contract
pub struct AlloyChainClient {
    rpc_url: String,
    contract: Address,
    signer: Option<PrivateKeySigner>,
}

impl fmt::Debug for AlloyChainClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlloyChainClient")
            .field("rpc_url", &self.rpc_url)
            .field("contract", &self.contract)
            .field("signer", &self.signer.as_ref().map(|s| s.address()))
            .finish()
    }
}

impl AlloyChainClient {
    /// Build a client from config; the signer is optional for read-only use.
    pub fn from_config(config: &AnchorConfig) -> Result<Self, ChainError> {
        let rpc_url = config
            .rpc_url
            .as_deref()
            .ok_or_else(|| ChainError::InvalidConfig(Missing::RpcUrl.to_string()))?
            .to_string();
        let contract = config
            .contract_address
            .as_deref()
            .ok_or_else(|| ChainError::InvalidConfig(Missing::ContractAddress.to_string()))?
            .parse::<Address>()
            .map_err(|e| ChainError::InvalidConfig(format!("invalid contract address: {e}")))?;
        let signer = config
            .private_key
            .as_deref()
            .map(|key| {
                key.parse::<PrivateKeySigner>()
                    .map_err(|e| ChainError::InvalidConfig(format!("invalid private key: {e}")))
            })
            .transpose()?;

        Ok(Self {
            rpc_url,
            contract,
            signer,
        })
    }
}

fn invalid_url(e: impl fmt::Display) -> ChainError {
    ChainError::InvalidConfig(format!("invalid RPC URL: {e}"))
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn submit_anchor(&self, call: &AnchorCall) -> Result<String, ChainError> {
        let signer = self
            .signer
            .clone()
            .ok_or_else(|| ChainError::InvalidConfig(Missing::SigningKey.to_string()))?;

        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(alloy::network::EthereumWallet::from(signer))
            .on_http(self.rpc_url.parse().map_err(invalid_url)?);

        let contract = ILedgerAnchor::new(self.contract, &provider);
        let tx = contract.anchorRoot(
            FixedBytes::from_slice(&call.root),
            call.period_start,
            call.period_end,
            call.event_count,
        );

        let pending = tx
            .send()
            .await
            .map_err(|e| ChainError::Submit(e.to_string()))?;
        let tx_hash = hex::encode(pending.tx_hash().0);

        tracing::info!(
            tx_hash = %tx_hash,
            root = %hex::encode(call.root),
            event_count = call.event_count,
            "Anchor transaction sent"
        );
        Ok(tx_hash)
    }

    async fn fetch_receipt(&self, tx_hash: &str) -> Result<Option<ChainReceipt>, ChainError> {
        let bytes = hex::decode(tx_hash.strip_prefix("0x").unwrap_or(tx_hash))
            .map_err(|e| ChainError::Rpc(format!("invalid transaction hash: {e}")))?;
        if bytes.len() != 32 {
            return Err(ChainError::Rpc("transaction hash must be 32 bytes".into()));
        }

        let provider = ProviderBuilder::new().on_http(self.rpc_url.parse().map_err(invalid_url)?);
        let receipt = provider
            .get_transaction_receipt(B256::from_slice(&bytes))
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        let anchored = receipt
            .inner
            .logs()
            .iter()
            .filter(|log| log.address() == self.contract)
            .find_map(|log| {
                log.log_decode::<ILedgerAnchor::RootAnchored>()
                    .ok()
                    .map(|decoded| (log.log_index, log.block_timestamp, decoded.inner.data.root.0))
            });

        let raw = serde_json::to_value(&receipt).unwrap_or_default();
        Ok(Some(ChainReceipt {
            tx_hash: hex::encode(receipt.transaction_hash.0),
            block_number,
            success: receipt.status(),
            log_index: anchored.and_then(|(index, _, _)| index),
            anchored_root: anchored.map(|(_, _, root)| root),
            block_timestamp: anchored.and_then(|(_, ts, _)| ts),
            raw,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> AnchorConfig {
        AnchorConfig {
            publish_enabled: true,
            rpc_url: Some("http://127.0.0.1:8545".into()),
            chain_id: Some(11155111),
            contract_address: Some("0x5FbDB2315678afecb367f032d93F642f64180aa3".into()),
            private_key: Some(
                "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".into(),
            ),
            network: "sepolia".into(),
            ..AnchorConfig::default()
        }
    }

    #[test]
    fn test_preconditions_reported_in_order() {
        assert_eq!(complete().missing_for_publish(), None);

        let mut config = complete();
        config.publish_enabled = false;
        assert_eq!(config.missing_for_publish(), Some(Missing::PublishingDisabled));
        assert_eq!(config.missing_for_confirm(), None);

        let mut config = complete();
        config.rpc_url = None;
        config.private_key = None;
        assert_eq!(config.missing_for_publish(), Some(Missing::RpcUrl));

        let mut config = complete();
        config.contract_address = None;
        assert_eq!(config.missing_for_publish(), Some(Missing::ContractAddress));

        let mut config = complete();
        config.private_key = None;
        assert_eq!(config.missing_for_publish(), Some(Missing::SigningKey));
        assert_eq!(config.missing_for_confirm(), None);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let rendered = format!("{:?}", complete());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("ac0974bec39a17e3"));
    }

    #[test]
    fn test_alloy_client_from_config() {
        let client = AlloyChainClient::from_config(&complete()).unwrap();
        assert!(client.signer.is_some());

        let mut read_only = complete();
        read_only.private_key = None;
        assert!(AlloyChainClient::from_config(&read_only)
            .unwrap()
            .signer
            .is_none());

        let mut bad = complete();
        bad.contract_address = Some("not-an-address".into());
        assert!(matches!(
            AlloyChainClient::from_config(&bad),
            Err(ChainError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Missing::ContractAddress).unwrap(),
            "\"contract_address\""
        );
    }
}
