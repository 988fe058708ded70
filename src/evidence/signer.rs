//! Export signing, the lazily loaded signing key, and signature verification

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::crypto::{
    signature_from_encoded, signature_to_base64, ExportSigningKey, ExportVerifyingKey,
};
use crate::domain::{KeyRecord, KeyStatus};
use crate::infra::{KeyRegistry, LedgerError};

use super::{EvidenceError, Result};

/// Detached signature over an export hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSignature {
    /// Base64 Ed25519 signature
    pub signature: String,
    pub key_id: String,
    pub public_key_pem: String,
}

/// Signs export hashes with one Ed25519 key
#[derive(Debug, Clone)]
pub struct ExportSigner {
    key: ExportSigningKey,
}

impl ExportSigner {
    pub fn new(key: ExportSigningKey) -> Self {
        Self { key }
    }

    pub fn key_id(&self) -> String {
        self.key.key_id()
    }

    pub fn public_key_pem(&self) -> String {
        self.key.public_key().to_pem()
    }

    /// Sign the UTF-8 bytes of the hex export hash.
    pub fn sign(&self, export_hash: &str) -> ExportSignature {
        ExportSignature {
            signature: signature_to_base64(&self.key.sign_export_hash(export_hash)),
            key_id: self.key.key_id(),
            public_key_pem: self.public_key_pem(),
        }
    }
}

// ============================================================================
// Signing Key Cache
// ============================================================================

/// Process-wide signing key, read from disk on first use.
///
/// The file holds a PKCS#8 PEM or 32 hex-encoded secret bytes. `reload`
/// drops the cached key so the next call re-reads the file.
#[derive(Debug)]
pub struct SigningKeyCache {
    path: Option<PathBuf>,
    cached: RwLock<Option<Arc<ExportSigner>>>,
}

impl SigningKeyCache {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            cached: RwLock::new(None),
        }
    }

    /// A cache preloaded with `signer`
    pub fn with_signer(signer: ExportSigner) -> Self {
        Self {
            path: None,
            cached: RwLock::new(Some(Arc::new(signer))),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.path.is_some()
    }

    pub async fn signer(&self) -> Result<Arc<ExportSigner>> {
        if let Some(signer) = self.cached.read().await.as_ref() {
            return Ok(signer.clone());
        }

        let mut cached = self.cached.write().await;
        if let Some(signer) = cached.as_ref() {
            return Ok(signer.clone());
        }

        let path = self.path.as_ref().ok_or(EvidenceError::SigningUnavailable)?;
        let material = tokio::fs::read_to_string(path).await?;
        let signer = Arc::new(ExportSigner::new(ExportSigningKey::from_key_material(
            &material,
        )?));
        tracing::info!(key_id = %signer.key_id(), "Export signing key loaded");

        *cached = Some(signer.clone());
        Ok(signer)
    }

    pub async fn reload(&self) {
        self.cached.write().await.take();
        tracing::info!("Export signing key cache cleared");
    }
}

// ============================================================================
// Signature Verification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureErrorCode {
    KeyNotFound,
    KeyRevoked,
    SignatureInvalid,
}

impl SignatureErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureErrorCode::KeyNotFound => "KEY_NOT_FOUND",
            SignatureErrorCode::KeyRevoked => "KEY_REVOKED",
            SignatureErrorCode::SignatureInvalid => "SIGNATURE_INVALID",
        }
    }
}

/// Result of checking a signature against the key registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureVerification {
    pub valid: bool,
    pub key_id: Option<String>,
    /// `active`, `inactive`, `revoked` or `unregistered`
    pub key_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SignatureErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
}

impl SignatureVerification {
    fn failed(code: SignatureErrorCode, key_id: Option<String>) -> Self {
        Self {
            valid: false,
            key_id,
            key_status: None,
            error: Some(code),
            revocation_reason: None,
        }
    }

    fn revoked(record: &KeyRecord) -> Self {
        Self {
            valid: false,
            key_id: Some(record.key_id.clone()),
            key_status: Some(KeyStatus::Revoked.as_str().to_string()),
            error: Some(SignatureErrorCode::KeyRevoked),
            revocation_reason: record.revocation_reason.clone(),
        }
    }
}

fn check(
    key: &ExportVerifyingKey,
    export_hash: &str,
    signature: &str,
    key_status: &str,
) -> SignatureVerification {
    let valid = signature_from_encoded(signature)
        .and_then(|sig| key.verify_export_hash(export_hash, &sig))
        .is_ok();
    SignatureVerification {
        valid,
        key_id: Some(key.key_id()),
        key_status: Some(key_status.to_string()),
        error: (!valid).then_some(SignatureErrorCode::SignatureInvalid),
        revocation_reason: None,
    }
}

/// Verify `signature` over `export_hash`.
///
/// The key is resolved by `key_id` through the registry, or else from the
/// embedded `public_key`. Revocation is checked before any signature math.
pub async fn verify_signature(
    registry: &dyn KeyRegistry,
    export_hash: &str,
    signature: &str,
    key_id: Option<&str>,
    public_key: Option<&str>,
) -> std::result::Result<SignatureVerification, LedgerError> {
    if let Some(key_id) = key_id {
        let Some(record) = registry.get(key_id).await? else {
            return Ok(SignatureVerification::failed(
                SignatureErrorCode::KeyNotFound,
                Some(key_id.to_string()),
            ));
        };
        if record.is_revoked {
            return Ok(SignatureVerification::revoked(&record));
        }
        let Ok(key) = ExportVerifyingKey::from_pem_or_hex(&record.public_key) else {
            return Ok(SignatureVerification::failed(
                SignatureErrorCode::SignatureInvalid,
                Some(record.key_id),
            ));
        };
        return Ok(check(&key, export_hash, signature, record.status().as_str()));
    }

    let Some(public_key) = public_key else {
        return Ok(SignatureVerification::failed(
            SignatureErrorCode::KeyNotFound,
            None,
        ));
    };
    let Ok(key) = ExportVerifyingKey::from_pem_or_hex(public_key) else {
        return Ok(SignatureVerification::failed(
            SignatureErrorCode::SignatureInvalid,
            None,
        ));
    };

    match registry.get(&key.key_id()).await? {
        Some(record) if record.is_revoked => Ok(SignatureVerification::revoked(&record)),
        Some(record) => Ok(check(&key, export_hash, signature, record.status().as_str())),
        None => Ok(check(&key, export_hash, signature, "unregistered")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{MemoryKeyRegistry, MockKeyRegistry};
    use chrono::Utc;
    use ed25519_dalek::pkcs8::EncodePrivateKey;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    async fn registered(signer: &ExportSigner) -> MemoryKeyRegistry {
        let registry = MemoryKeyRegistry::new();
        registry
            .register(KeyRecord::new(
                signer.key_id(),
                signer.public_key_pem(),
                Utc::now(),
            ))
            .await
            .unwrap();
        registry.activate(&signer.key_id()).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_signature_lifecycle() {
        let signer = ExportSigner::new(ExportSigningKey::generate());
        let registry = registered(&signer).await;
        let sig = signer.sign(HASH);

        let ok = verify_signature(&registry, HASH, &sig.signature, Some(&sig.key_id), None)
            .await
            .unwrap();
        assert!(ok.valid);
        assert_eq!(ok.key_status.as_deref(), Some("active"));

        // Altered hash
        let bad = verify_signature(
            &registry,
            &HASH.replace('9', "8"),
            &sig.signature,
            Some(&sig.key_id),
            None,
        )
        .await
        .unwrap();
        assert_eq!(bad.error, Some(SignatureErrorCode::SignatureInvalid));

        registry.revoke(&sig.key_id, "compromised").await.unwrap();
        let revoked =
            verify_signature(&registry, HASH, &sig.signature, Some(&sig.key_id), None)
                .await
                .unwrap();
        assert!(!revoked.valid);
        assert_eq!(revoked.error, Some(SignatureErrorCode::KeyRevoked));
        assert_eq!(revoked.revocation_reason.as_deref(), Some("compromised"));

        let unknown = verify_signature(
            &registry,
            HASH,
            &sig.signature,
            Some("ffffffffffffffff"),
            None,
        )
        .await
        .unwrap();
        assert_eq!(unknown.error, Some(SignatureErrorCode::KeyNotFound));
    }

    #[tokio::test]
    async fn test_embedded_public_key_paths() {
        let signer = ExportSigner::new(ExportSigningKey::generate());
        let sig = signer.sign(HASH);

        let empty = MemoryKeyRegistry::new();
        let unregistered =
            verify_signature(&empty, HASH, &sig.signature, None, Some(&sig.public_key_pem))
                .await
                .unwrap();
        assert!(unregistered.valid);
        assert_eq!(unregistered.key_status.as_deref(), Some("unregistered"));

        let registry = registered(&signer).await;
        registry.revoke(&sig.key_id, "rotated out").await.unwrap();
        let revoked =
            verify_signature(&registry, HASH, &sig.signature, None, Some(&sig.public_key_pem))
                .await
                .unwrap();
        assert_eq!(revoked.error, Some(SignatureErrorCode::KeyRevoked));

        let garbage = verify_signature(&empty, HASH, "%%%", None, Some(&sig.public_key_pem))
            .await
            .unwrap();
        assert_eq!(garbage.error, Some(SignatureErrorCode::SignatureInvalid));

        let bad_key = verify_signature(&empty, HASH, &sig.signature, None, Some("not a key"))
            .await
            .unwrap();
        assert_eq!(bad_key.error, Some(SignatureErrorCode::SignatureInvalid));

        let nothing = verify_signature(&empty, HASH, &sig.signature, None, None)
            .await
            .unwrap();
        assert_eq!(nothing.error, Some(SignatureErrorCode::KeyNotFound));
    }

    #[tokio::test]
    async fn test_revocation_checked_before_signature() {
        let mut registry = MockKeyRegistry::new();
        registry.expect_get().returning(|key_id| {
            let mut record = KeyRecord::new(key_id, "not a pem", Utc::now());
            record.is_revoked = true;
            record.revocation_reason = Some("lost laptop".into());
            Ok(Some(record))
        });

        let result = verify_signature(&registry, HASH, "garbage", Some("0011223344556677"), None)
            .await
            .unwrap();
        assert_eq!(result.error, Some(SignatureErrorCode::KeyRevoked));
    }

    #[tokio::test]
    async fn test_cache_loads_lazily_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export-signing.pem");

        let first = ExportSigningKey::generate();
        let pem = ed25519_dalek::SigningKey::from_bytes(&first.to_bytes())
            .to_pkcs8_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
            .unwrap();
        std::fs::write(&path, pem.as_bytes()).unwrap();

        let cache = SigningKeyCache::new(Some(path.clone()));
        assert_eq!(cache.signer().await.unwrap().key_id(), first.key_id());

        let second = ExportSigningKey::generate();
        std::fs::write(&path, hex::encode(second.to_bytes())).unwrap();
        assert_eq!(cache.signer().await.unwrap().key_id(), first.key_id());

        cache.reload().await;
        assert_eq!(cache.signer().await.unwrap().key_id(), second.key_id());
    }

    #[tokio::test]
    async fn test_cache_without_path_is_unavailable() {
        let cache = SigningKeyCache::new(None);
        assert!(!cache.is_configured());
        assert!(matches!(
            cache.signer().await,
            Err(EvidenceError::SigningUnavailable)
        ));
    }

    #[test]
    fn test_error_codes_serialize_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&SignatureErrorCode::KeyRevoked).unwrap(),
            "\"KEY_REVOKED\""
        );
        assert_eq!(SignatureErrorCode::SignatureInvalid.as_str(), "SIGNATURE_INVALID");
    }
}
