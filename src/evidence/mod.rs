//! Evidence exports
//!
//! An export is a snapshot of one entity plus its ledger history, bound by
//! `export_hash` over the canonical JSON of everything except the signature
//! envelope. Exports can be signed with Ed25519, packaged as a zip bundle and
//! verified offline.

mod bundle;
mod service;
mod signer;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::crypto::{canonicalize_json, sha256_hex, SigningError};
use crate::domain::{
    EvidenceExport, HistoryEntry, LedgerEvent, Subject, EXPORT_ENVELOPE_FIELDS,
    EXPORT_SCHEMA_VERSION,
};
use crate::infra::LedgerError;

pub use bundle::{build_bundle, read_bundle, BundleContents, BUNDLE_FILES};
pub use service::{
    EvidenceService, EvidenceVerification, LatestPayloadSnapshot, SnapshotProvider,
};
#[cfg(test)]
pub use service::MockSnapshotProvider;
pub use signer::{
    verify_signature, ExportSignature, ExportSigner, SignatureErrorCode, SignatureVerification,
    SigningKeyCache,
};

/// Evidence failures
#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("export signing is not configured")]
    SigningUnavailable,

    #[error("signing key {0} is revoked")]
    SigningKeyRevoked(String),

    #[error("signing key error: {0}")]
    Key(#[from] SigningError),

    #[error("bundle error: {0}")]
    Bundle(String),

    #[error(transparent)]
    Store(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EvidenceError>;

fn history_entry(event: &LedgerEvent) -> HistoryEntry {
    let payload = event.payload().unwrap_or_else(|e| {
        tracing::warn!(event_id = event.id, error = %e, "Unreadable payload in export history");
        Value::Object(Map::new())
    });
    HistoryEntry {
        id: event.id,
        event_type: event.event_type.clone(),
        payload,
        created_at: event.created_at.clone(),
        block_hash: event.block_hash.clone(),
        prev_hash: event.prev_hash.clone(),
        actor_id: event.actor_id,
    }
}

/// Hash of an export body: the document without its envelope fields.
pub fn compute_export_hash(body: &Value) -> String {
    let mut stripped = body.clone();
    if let Value::Object(map) = &mut stripped {
        for field in EXPORT_ENVELOPE_FIELDS {
            map.remove(field);
        }
    }
    sha256_hex(canonicalize_json(&stripped).as_bytes())
}

/// Build an unsigned export. History order is preserved and hash-significant.
pub fn build_export(
    subject: &Subject,
    snapshot: Value,
    rows: &[LedgerEvent],
    exported_at: &str,
) -> Result<EvidenceExport> {
    let history: Vec<HistoryEntry> = rows.iter().map(history_entry).collect();

    let body = json!({
        "schema_version": EXPORT_SCHEMA_VERSION,
        "exported_at": exported_at,
        "subject": subject,
        "snapshot": snapshot,
        "history": serde_json::to_value(&history)?,
    });
    let export_hash = compute_export_hash(&body);

    Ok(EvidenceExport {
        schema_version: EXPORT_SCHEMA_VERSION,
        exported_at: exported_at.to_string(),
        subject: subject.clone(),
        snapshot,
        history,
        export_hash,
        export_signature: None,
        export_key_id: None,
        export_public_key: None,
    })
}

/// Outcome of recomputing an export's hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentVerification {
    pub valid: bool,
    /// Hash claimed by the document
    pub export_hash: Option<String>,
    pub computed_hash: String,
}

/// Recompute `export_hash` from the document body and compare.
pub fn verify_export_content(export: &Value) -> ContentVerification {
    let claimed = export
        .get("export_hash")
        .and_then(Value::as_str)
        .map(str::to_string);
    let computed_hash = compute_export_hash(export);
    ContentVerification {
        valid: export.is_object() && claimed.as_deref() == Some(computed_hash.as_str()),
        export_hash: claimed,
        computed_hash,
    }
}
