//! Evidence export and verification handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::api::auth_helpers::ensure;
use crate::api::error::{validation_error, ApiError};
use crate::api::types::{ExportQuery, VerifyEvidenceRequest};
use crate::domain::Subject;
use crate::evidence::{build_bundle, EvidenceVerification};
use crate::metrics::metric_names;
use crate::server::AppState;
use crate::verification::{Caller, Capability};

/// GET /api/evidence/:entity_type/:entity_id - Export an entity with its ledger history.
///
/// `?signed=1` signs the export hash; `?format=bundle` returns a zip.
pub async fn export_evidence(
    State(state): State<AppState>,
    caller: Caller,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    ensure(&state, &caller, Capability::EvidenceExport)?;

    let subject = Subject::new(entity_type, entity_id);
    let export = state
        .evidence
        .export(&subject, query.wants_signature())
        .await?;
    state.metrics.inc_counter(metric_names::EVIDENCE_EXPORTS).await;

    if !query.wants_bundle() {
        return Ok(Json(export).into_response());
    }

    let bytes = build_bundle(&export)?;
    let disposition = format!(
        "attachment; filename=\"evidence-{}-{}.zip\"",
        sanitize(&subject.entity_type),
        sanitize(&subject.entity_id)
    );
    let mut response = bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// POST /api/evidence/verify - Check an export's content hash and signature.
pub async fn verify_evidence(
    State(state): State<AppState>,
    body: Result<Json<VerifyEvidenceRequest>, JsonRejection>,
) -> Result<Json<EvidenceVerification>, ApiError> {
    let Json(request) = body?;
    let export = match request.export_json {
        Value::String(text) => serde_json::from_str::<Value>(&text)
            .map_err(|e| validation_error("export_json", format!("not valid JSON: {e}")))?,
        other => other,
    };
    if !export.is_object() {
        return Err(validation_error("export_json", "export must be a JSON object"));
    }

    let verdict = state
        .evidence
        .verify(&export, request.signature.as_deref(), request.key_id.as_deref())
        .await?;
    state
        .metrics
        .inc_counter(metric_names::EVIDENCE_VERIFICATIONS)
        .await;
    Ok(Json(verdict))
}
