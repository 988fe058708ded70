//! Evidence export document

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Subject;

/// Current export document version
pub const EXPORT_SCHEMA_VERSION: u32 = 1;

/// Fields never included in the export hash input
pub const EXPORT_ENVELOPE_FIELDS: [&str; 4] = [
    "export_hash",
    "export_signature",
    "export_key_id",
    "export_public_key",
];

/// One ledger event as it appears in an export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub event_type: String,
    pub payload: Value,
    pub created_at: String,
    pub block_hash: String,
    pub prev_hash: Option<String>,
    pub actor_id: Option<i64>,
}

/// Hashable snapshot of one entity plus its ledger history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceExport {
    pub schema_version: u32,
    pub exported_at: String,
    pub subject: Subject,
    pub snapshot: Value,
    pub history: Vec<HistoryEntry>,
    pub export_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_public_key: Option<String>,
}

impl EvidenceExport {
    pub fn is_signed(&self) -> bool {
        self.export_signature.is_some()
    }
}
