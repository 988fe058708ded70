//! Anchor records: one Merkle root per UTC day

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::AnchorPeriod;

/// Anchor lifecycle state
///
/// `Empty`, `Confirmed` and `Failed` are terminal. A submitted anchor is
/// still `Pending`, distinguished by a recorded `tx_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    Empty,
    Pending,
    Confirmed,
    Failed,
}

impl AnchorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorStatus::Empty => "empty",
            AnchorStatus::Pending => "pending",
            AnchorStatus::Confirmed => "confirmed",
            AnchorStatus::Failed => "failed",
        }
    }

    /// Statuses that occupy their period; at most one per period.
    pub fn occupies_period(&self) -> bool {
        !matches!(self, AnchorStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnchorStatus::Pending)
    }
}

impl fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnchorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(AnchorStatus::Empty),
            "pending" => Ok(AnchorStatus::Pending),
            "confirmed" => Ok(AnchorStatus::Confirmed),
            "failed" => Ok(AnchorStatus::Failed),
            other => Err(format!("unknown anchor status: {other}")),
        }
    }
}

/// A period's Merkle root and its publication state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub events_count: i64,
    /// Hex root; `None` only for empty periods
    pub merkle_root: Option<String>,
    pub status: AnchorStatus,
    pub network: Option<String>,
    pub chain_id: Option<i64>,
    pub contract_address: Option<String>,
    /// Hex, no `0x`
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub log_index: Option<i64>,
    pub anchored_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Anchor {
    pub fn period(&self) -> AnchorPeriod {
        AnchorPeriod {
            start: self.period_start,
            end: self.period_end,
        }
    }

    /// Pending with a transaction in flight
    pub fn is_submitted(&self) -> bool {
        self.status == AnchorStatus::Pending && self.tx_hash.is_some()
    }
}

/// Row to insert when a period is batched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAnchor {
    pub period: AnchorPeriod,
    pub events_count: i64,
    pub merkle_root: Option<String>,
    pub status: AnchorStatus,
    pub created_at: DateTime<Utc>,
}

/// Transaction details recorded at publish time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorSubmission {
    pub tx_hash: String,
    pub network: String,
    pub chain_id: i64,
    pub contract_address: String,
    pub submitted_at: DateTime<Utc>,
}

/// Inclusion details recorded at confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorConfirmation {
    pub block_number: i64,
    pub log_index: Option<i64>,
    pub anchored_at: DateTime<Utc>,
}

/// Filter for anchor listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnchorFilter {
    /// Periods starting at or after
    pub from: Option<DateTime<Utc>>,
    /// Periods starting before
    pub to: Option<DateTime<Utc>>,
    pub status: Option<AnchorStatus>,
    pub limit: i64,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_flags() {
        for status in [
            AnchorStatus::Empty,
            AnchorStatus::Pending,
            AnchorStatus::Confirmed,
            AnchorStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<AnchorStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<AnchorStatus>().is_err());

        assert!(!AnchorStatus::Failed.occupies_period());
        assert!(AnchorStatus::Empty.occupies_period());
        assert!(!AnchorStatus::Pending.is_terminal());
        assert!(AnchorStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AnchorStatus::Confirmed).unwrap(),
            "\"confirmed\""
        );
    }
}
