//! On-chain anchoring
//!
//! Publishes daily Merkle roots to the `ILedgerAnchor` contract, confirms the
//! transactions and builds offline proof bundles for auditors.

mod chain;
mod proof;
mod publisher;

#[cfg(test)]
pub use chain::MockChainClient;
pub use chain::{
    AlloyChainClient, AnchorCall, AnchorConfig, ChainClient, ChainError, ChainReceipt, Missing,
    ILedgerAnchor,
};
pub use proof::{
    InclusionProof, OnchainInfo, ProofBundle, ProofVerification, ReceiptInfo, ToolInfo,
};
pub use publisher::{AnchorPublisher, ConfirmError, ConfirmOutcome, PublishError, PublishOutcome};
