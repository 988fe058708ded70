//! Shared request and response types for REST API handlers.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::Anchor;
use crate::infra::VerifyScope;

// ============================================================================
// Ledger types
// ============================================================================

/// Request body for a ledger append.
#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    pub event_type: String,
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct AppendResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_lettered: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VerifyQuery {
    pub from_id: Option<i64>,
    pub to_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<VerifyScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Anchor types
// ============================================================================

/// Query for anchor listings; dates are inclusive UTC days.
#[derive(Debug, Default, Deserialize)]
pub struct ListAnchorsQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorListResponse {
    pub network: String,
    pub chain_id: Option<u64>,
    pub range: DateRange,
    pub items: Vec<Anchor>,
    pub page: Page,
}

// ============================================================================
// Evidence types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    /// `1` or `true` to sign
    pub signed: Option<String>,
    /// `json` (default) or `bundle`
    pub format: Option<String>,
}

impl ExportQuery {
    pub fn wants_signature(&self) -> bool {
        matches!(
            self.signed.as_deref().map(str::trim),
            Some("1") | Some("true") | Some("yes")
        )
    }

    pub fn wants_bundle(&self) -> bool {
        self.format.as_deref() == Some("bundle")
    }
}

/// Request body for evidence verification.
///
/// `export_json` may be the export object or its JSON text.
#[derive(Debug, Deserialize)]
pub struct VerifyEvidenceRequest {
    pub export_json: Value,
    pub signature: Option<String>,
    pub key_id: Option<String>,
}
