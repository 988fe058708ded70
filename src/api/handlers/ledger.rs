//! Ledger append, verification and inclusion handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::anchor::InclusionProof;
use crate::api::auth_helpers::ensure;
use crate::api::error::ApiError;
use crate::api::types::{AppendRequest, AppendResponse, VerifyQuery, VerifyResponse};
use crate::infra::AppendError;
use crate::metrics::{metric_names, timed};
use crate::server::AppState;
use crate::verification::{Caller, Capability};

/// POST /api/ledger/events - Append one event to the hash chain.
///
/// A body that is not `{event_type, payload}` JSON is rejected with 400
/// before anything is hashed.
pub async fn append_event(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<AppendRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AppendResponse>), ApiError> {
    ensure(&state, &caller, Capability::LedgerWrite)?;
    let Json(request) = body?;

    let result = timed(
        &state.metrics,
        metric_names::LEDGER_APPEND_LATENCY,
        state
            .ledger
            .append(&request.event_type, request.payload, caller.actor_id),
    )
    .await;

    match result {
        Ok(block_hash) => {
            state.metrics.inc_counter(metric_names::LEDGER_APPENDS_OK).await;
            Ok((
                StatusCode::OK,
                Json(AppendResponse {
                    ok: true,
                    block_hash: Some(block_hash),
                    error: None,
                    dead_lettered: None,
                }),
            ))
        }
        Err(AppendError::Validation(message)) => {
            state
                .metrics
                .inc_counter(metric_names::LEDGER_APPENDS_REJECTED)
                .await;
            Ok((
                StatusCode::BAD_REQUEST,
                Json(AppendResponse {
                    ok: false,
                    block_hash: None,
                    error: Some(message),
                    dead_lettered: Some(false),
                }),
            ))
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                event_type = %request.event_type,
                dead_lettered = e.dead_lettered(),
                "Ledger append failed"
            );
            state
                .metrics
                .inc_counter(metric_names::LEDGER_APPENDS_FAILED)
                .await;
            if e.dead_lettered() {
                state
                    .metrics
                    .inc_counter(metric_names::LEDGER_DEAD_LETTERED)
                    .await;
            }
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AppendResponse {
                    ok: false,
                    block_hash: None,
                    error: Some("internal error".to_string()),
                    dead_lettered: Some(e.dead_lettered()),
                }),
            ))
        }
    }
}

/// GET /api/ledger/verify - Verify the whole chain or an id range.
pub async fn verify_ledger(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<VerifyQuery>,
) -> Result<(StatusCode, Json<VerifyResponse>), ApiError> {
    ensure(&state, &caller, Capability::LedgerRead)?;

    match state.ledger.verify(query.from_id, query.to_id).await {
        Ok(outcome) if outcome.ok => Ok((
            StatusCode::OK,
            Json(VerifyResponse {
                ok: true,
                message: outcome.message,
                scope: Some(outcome.scope),
                error: None,
            }),
        )),
        Ok(outcome) => Ok((
            StatusCode::OK,
            Json(VerifyResponse {
                ok: false,
                message: None,
                scope: None,
                error: outcome.error,
            }),
        )),
        Err(e) => {
            tracing::error!(error = %e, "Ledger verification failed to run");
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(VerifyResponse {
                    ok: false,
                    message: None,
                    scope: None,
                    error: Some("internal error".to_string()),
                }),
            ))
        }
    }
}

/// GET /api/ledger/events/:id/inclusion - Merkle path from an event to its day's anchor.
pub async fn event_inclusion(
    State(state): State<AppState>,
    caller: Caller,
    Path(event_id): Path<i64>,
) -> Result<Json<InclusionProof>, ApiError> {
    ensure(&state, &caller, Capability::LedgerRead)?;
    Ok(Json(state.publisher.event_inclusion(event_id).await?))
}
