//! Zip packaging of an export for offline verification

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::crypto::sha256_hex;
use crate::domain::EvidenceExport;

use super::{EvidenceError, Result};

pub const EXPORT_FILE: &str = "export.json";
pub const SIGNATURE_FILE: &str = "export.signature";
pub const PUBLIC_KEY_FILE: &str = "public.pem";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Files of a signed bundle, manifest last
pub const BUNDLE_FILES: [&str; 4] = [EXPORT_FILE, SIGNATURE_FILE, PUBLIC_KEY_FILE, MANIFEST_FILE];

fn bundle_err(e: zip::result::ZipError) -> EvidenceError {
    EvidenceError::Bundle(e.to_string())
}

/// Zip `export.json`, the detached signature and public key (when signed),
/// and `manifest.json` listing the SHA-256 of every other file.
pub fn build_bundle(export: &EvidenceExport) -> Result<Vec<u8>> {
    let mut files: Vec<(&str, Vec<u8>)> = vec![(EXPORT_FILE, serde_json::to_vec_pretty(export)?)];
    if let Some(signature) = &export.export_signature {
        files.push((SIGNATURE_FILE, signature.as_bytes().to_vec()));
    }
    if let Some(public_key) = &export.export_public_key {
        files.push((PUBLIC_KEY_FILE, public_key.as_bytes().to_vec()));
    }

    let digests: BTreeMap<&str, String> = files
        .iter()
        .map(|(name, bytes)| (*name, sha256_hex(bytes)))
        .collect();
    let manifest = serde_json::to_vec_pretty(&json!({ "files": digests }))?;
    files.push((MANIFEST_FILE, manifest));

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in &files {
        writer.start_file(*name, options).map_err(bundle_err)?;
        writer.write_all(bytes)?;
    }
    let cursor = writer.finish().map_err(bundle_err)?;
    Ok(cursor.into_inner())
}

/// A bundle read back from zip bytes
#[derive(Debug, Clone)]
pub struct BundleContents {
    pub export: Value,
    pub signature: Option<String>,
    pub public_key: Option<String>,
    /// Every manifest entry matches its file's hash
    pub manifest_ok: bool,
}

pub fn read_bundle(bytes: &[u8]) -> Result<BundleContents> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(bundle_err)?;

    let mut read = |name: &str| -> Result<Option<Vec<u8>>> {
        match archive.by_name(name) {
            Ok(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;
                Ok(Some(buf))
            }
            Err(zip::result::ZipError::FileNotFound) => Ok(None),
            Err(e) => Err(bundle_err(e)),
        }
    };

    let export_bytes = read(EXPORT_FILE)?
        .ok_or_else(|| EvidenceError::Bundle(format!("{EXPORT_FILE} missing")))?;
    let signature = read(SIGNATURE_FILE)?;
    let public_key = read(PUBLIC_KEY_FILE)?;
    let manifest: Value = match read(MANIFEST_FILE)? {
        Some(bytes) => serde_json::from_slice(&bytes)?,
        None => Value::Null,
    };

    let mut present = vec![(EXPORT_FILE, &export_bytes)];
    if let Some(bytes) = &signature {
        present.push((SIGNATURE_FILE, bytes));
    }
    if let Some(bytes) = &public_key {
        present.push((PUBLIC_KEY_FILE, bytes));
    }
    let listed = manifest["files"].as_object().map(|m| m.len()).unwrap_or(0);
    let manifest_ok = listed == present.len()
        && present.iter().all(|(name, bytes)| {
            manifest["files"][*name].as_str() == Some(sha256_hex(bytes).as_str())
        });

    let text = |bytes: Option<Vec<u8>>| bytes.map(|b| String::from_utf8_lossy(&b).into_owned());
    Ok(BundleContents {
        export: serde_json::from_slice(&export_bytes)?,
        signature: text(signature),
        public_key: text(public_key),
        manifest_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Subject;
    use crate::evidence::{build_export, verify_export_content, ExportSigner};
    use crate::crypto::ExportSigningKey;

    fn export() -> EvidenceExport {
        build_export(
            &Subject::new("tmc_item", "A-100"),
            json!({"qty": 4}),
            &[],
            "2026-01-06T00:00:00.000000Z",
        )
        .unwrap()
    }

    #[test]
    fn test_signed_bundle_round_trip() {
        let signer = ExportSigner::new(ExportSigningKey::generate());
        let mut export = export();
        let sig = signer.sign(&export.export_hash);
        export.export_signature = Some(sig.signature.clone());
        export.export_key_id = Some(sig.key_id.clone());
        export.export_public_key = Some(sig.public_key_pem.clone());

        let bytes = build_bundle(&export).unwrap();
        let contents = read_bundle(&bytes).unwrap();
        assert!(contents.manifest_ok);
        assert_eq!(contents.signature.as_deref(), Some(sig.signature.as_str()));
        assert_eq!(contents.public_key.as_deref(), Some(sig.public_key_pem.as_str()));
        assert!(verify_export_content(&contents.export).valid);
    }

    #[test]
    fn test_unsigned_bundle_has_export_and_manifest() {
        let contents = read_bundle(&build_bundle(&export()).unwrap()).unwrap();
        assert!(contents.manifest_ok);
        assert!(contents.signature.is_none());
        assert!(contents.public_key.is_none());
    }

    #[test]
    fn test_garbage_is_not_a_bundle() {
        assert!(matches!(
            read_bundle(b"definitely not a zip"),
            Err(EvidenceError::Bundle(_))
        ));
    }
}
