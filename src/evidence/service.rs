//! Export and verification entry points used by the HTTP layer and CLI

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::domain::{
    format_timestamp, Clock, EvidenceExport, KeyRecord, LedgerEvent, Subject, SystemClock,
};
use crate::infra::{KeyRegistry, LedgerStore};

use super::{
    build_export, verify_export_content, verify_signature, ContentVerification, EvidenceError,
    Result, SignatureVerification, SigningKeyCache,
};

/// Source of the current state of an entity.
///
/// The host application owns entity rows; the ledger only sees their history.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self, subject: &Subject, history: &[LedgerEvent]) -> Result<Value>;
}

/// Uses the most recent readable payload as the snapshot, or `{}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestPayloadSnapshot;

#[async_trait]
impl SnapshotProvider for LatestPayloadSnapshot {
    async fn snapshot(&self, _subject: &Subject, history: &[LedgerEvent]) -> Result<Value> {
        Ok(history
            .iter()
            .rev()
            .find_map(|event| event.payload().ok())
            .unwrap_or_else(|| Value::Object(Map::new())))
    }
}

/// Combined verdict on an export document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceVerification {
    pub ok: bool,
    pub content: ContentVerification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureVerification>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

pub struct EvidenceService {
    events: Arc<dyn LedgerStore>,
    keys: Arc<dyn KeyRegistry>,
    signing: Arc<SigningKeyCache>,
    snapshots: Arc<dyn SnapshotProvider>,
    clock: Arc<dyn Clock>,
}

impl EvidenceService {
    pub fn new(
        events: Arc<dyn LedgerStore>,
        keys: Arc<dyn KeyRegistry>,
        signing: Arc<SigningKeyCache>,
    ) -> Self {
        Self {
            events,
            keys,
            signing,
            snapshots: Arc::new(LatestPayloadSnapshot),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_snapshot_provider(mut self, snapshots: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn signing(&self) -> &Arc<SigningKeyCache> {
        &self.signing
    }

    pub fn keys(&self) -> &Arc<dyn KeyRegistry> {
        &self.keys
    }

    /// Export `subject` with its full ledger history, optionally signed.
    pub async fn export(&self, subject: &Subject, signed: bool) -> Result<EvidenceExport> {
        let history = self.events.for_subject(subject).await?;
        let snapshot = self.snapshots.snapshot(subject, &history).await?;
        let exported_at = format_timestamp(self.clock.now());

        let mut export = build_export(subject, snapshot, &history, &exported_at)?;
        if signed {
            self.sign(&mut export).await?;
        }

        tracing::info!(
            %subject,
            events = export.history.len(),
            signed,
            export_hash = %export.export_hash,
            "Evidence exported"
        );
        Ok(export)
    }

    async fn sign(&self, export: &mut EvidenceExport) -> Result<()> {
        let signer = self.signing.signer().await?;
        let key_id = signer.key_id();

        match self.keys.get(&key_id).await? {
            Some(record) if record.is_revoked => {
                return Err(EvidenceError::SigningKeyRevoked(key_id));
            }
            Some(_) => {}
            None => {
                let record = KeyRecord::new(&key_id, signer.public_key_pem(), self.clock.now());
                self.keys.register(record).await?;
                self.keys.activate(&key_id).await?;
                tracing::info!(%key_id, "Export signing key registered");
            }
        }

        let signature = signer.sign(&export.export_hash);
        export.export_signature = Some(signature.signature);
        export.export_key_id = Some(signature.key_id);
        export.export_public_key = Some(signature.public_key_pem);
        Ok(())
    }

    /// Check an export's content hash and, when present, its signature.
    ///
    /// `signature` and `key_id` override the values embedded in the document.
    pub async fn verify(
        &self,
        export: &Value,
        signature: Option<&str>,
        key_id: Option<&str>,
    ) -> Result<EvidenceVerification> {
        let content = verify_export_content(export);
        let mut errors = Vec::new();
        if !content.valid {
            errors.push("EXPORT_HASH_MISMATCH".to_string());
        }

        let embedded = |field: &str| export.get(field).and_then(Value::as_str);
        let signature = signature.or_else(|| embedded("export_signature"));
        let key_id = key_id.or_else(|| embedded("export_key_id"));
        let public_key = embedded("export_public_key");

        let signature = match signature {
            Some(signature) => {
                let export_hash = content.export_hash.as_deref().unwrap_or(&content.computed_hash);
                let result = verify_signature(
                    self.keys.as_ref(),
                    export_hash,
                    signature,
                    key_id,
                    public_key,
                )
                .await?;
                if let Some(code) = result.error {
                    errors.push(code.as_str().to_string());
                }
                Some(result)
            }
            None => None,
        };

        Ok(EvidenceVerification {
            ok: errors.is_empty(),
            content,
            signature,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ExportSigningKey;
    use crate::domain::FixedClock;
    use crate::evidence::ExportSigner;
    use crate::infra::{Ledger, MemoryKeyRegistry, MemoryLedgerStore, RetryPolicy};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        service: EvidenceService,
        keys: Arc<MemoryKeyRegistry>,
        key_id: String,
    }

    async fn fixture() -> Fixture {
        let events = Arc::new(MemoryLedgerStore::new());
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap());
        let ledger = Ledger::new(events.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_retry_policy(RetryPolicy::immediate(1));

        let transitions = [
            (None, "open"),
            (Some("open"), "in_review"),
            (Some("in_review"), "closed"),
        ];
        for (from, to) in transitions {
            let mut payload = json!({
                "entity_type": "inspection",
                "entity_id": 12,
                "to_status": to,
            });
            if let Some(from) = from {
                payload["from_status"] = json!(from);
            }
            ledger.append("inspection.transition", payload, Some(3)).await.unwrap();
        }
        let other = json!({"entity_type": "inspection", "entity_id": 13, "to_status": "open"});
        ledger
            .append("inspection.transition", other, Some(3))
            .await
            .unwrap();

        let signer = ExportSigner::new(ExportSigningKey::generate());
        let key_id = signer.key_id();
        let keys = Arc::new(MemoryKeyRegistry::new());
        let service = EvidenceService::new(
            events,
            keys.clone(),
            Arc::new(SigningKeyCache::with_signer(signer)),
        )
        .with_clock(Arc::new(clock));

        Fixture {
            service,
            keys,
            key_id,
        }
    }

    #[tokio::test]
    async fn test_export_collects_subject_history_in_order() {
        let fixture = fixture().await;
        let export = fixture
            .service
            .export(&Subject::new("inspection", "12"), false)
            .await
            .unwrap();

        assert_eq!(export.history.len(), 3);
        assert_eq!(export.history[2].payload["to_status"], "closed");
        assert_eq!(export.snapshot["to_status"], "closed");
        assert!(!export.is_signed());
        assert_eq!(export.exported_at, "2026-01-05T08:00:00.000000Z");
    }

    #[tokio::test]
    async fn test_signed_export_verifies_then_fails_after_revocation() {
        let fixture = fixture().await;
        let export = fixture
            .service
            .export(&Subject::new("inspection", "12"), true)
            .await
            .unwrap();
        assert_eq!(export.export_key_id.as_deref(), Some(fixture.key_id.as_str()));

        let value = serde_json::to_value(&export).unwrap();
        let verdict = fixture.service.verify(&value, None, None).await.unwrap();
        assert!(verdict.ok, "{:?}", verdict.errors);
        assert_eq!(
            verdict.signature.unwrap().key_status.as_deref(),
            Some("active")
        );

        let mut tampered = value.clone();
        tampered["snapshot"]["to_status"] = json!("open");
        let verdict = fixture.service.verify(&tampered, None, None).await.unwrap();
        assert!(!verdict.ok);
        assert!(verdict.errors.contains(&"EXPORT_HASH_MISMATCH".to_string()));

        fixture.keys.revoke(&fixture.key_id, "key rotation").await.unwrap();
        let verdict = fixture.service.verify(&value, None, None).await.unwrap();
        assert!(!verdict.ok);
        assert_eq!(verdict.errors, vec!["KEY_REVOKED".to_string()]);

        assert!(matches!(
            fixture
                .service
                .export(&Subject::new("inspection", "12"), true)
                .await,
            Err(EvidenceError::SigningKeyRevoked(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_snapshot_provider() {
        let fixture = fixture().await;
        let mut provider = MockSnapshotProvider::new();
        provider
            .expect_snapshot()
            .withf(|subject, history| subject.entity_id == "13" && history.len() == 1)
            .returning(|_, _| Ok(json!({"id": 13, "status": "open", "title": "Borescope"})));

        let service = fixture.service.with_snapshot_provider(Arc::new(provider));
        let export = service
            .export(&Subject::new("inspection", "13"), false)
            .await
            .unwrap();
        assert_eq!(export.snapshot["title"], "Borescope");
    }

    #[tokio::test]
    async fn test_unsigned_export_verifies_content_only() {
        let fixture = fixture().await;
        let export = fixture
            .service
            .export(&Subject::new("inspection", "12"), false)
            .await
            .unwrap();
        let verdict = fixture
            .service
            .verify(&serde_json::to_value(&export).unwrap(), None, None)
            .await
            .unwrap();
        assert!(verdict.ok);
        assert!(verdict.signature.is_none());
    }
}
