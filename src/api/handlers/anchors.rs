//! Anchor listing, proof and publication handlers.

use axum::extract::{Path, Query, State};
use axum::Json;

use crate::anchor::{ConfirmOutcome, ProofBundle, PublishOutcome};
use crate::api::auth_helpers::ensure;
use crate::api::error::{validation_error, ApiError};
use crate::api::types::{AnchorListResponse, DateRange, ListAnchorsQuery, Page};
use crate::domain::{AnchorFilter, AnchorPeriod, AnchorStatus};
use crate::metrics::metric_names;
use crate::server::AppState;
use crate::verification::{Caller, Capability};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

/// GET /api/anchors - List anchors by period and status.
pub async fn list_anchors(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<ListAnchorsQuery>,
) -> Result<Json<AnchorListResponse>, ApiError> {
    ensure(&state, &caller, Capability::LedgerRead)?;

    let status = query
        .status
        .as_deref()
        .map(str::parse::<AnchorStatus>)
        .transpose()
        .map_err(|e| validation_error("status", e))?;
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(validation_error("from", "from must not be after to"));
        }
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let filter = AnchorFilter {
        from: query.from.map(|from| AnchorPeriod::for_day(from).start),
        to: query.to.map(|to| AnchorPeriod::for_day(to).end),
        status,
        limit,
        offset,
    };
    let (items, total) = state.anchors.list(&filter).await?;

    let config = state.publisher.config();
    Ok(Json(AnchorListResponse {
        network: config.network.clone(),
        chain_id: config.chain_id,
        range: DateRange {
            from: query.from,
            to: query.to,
        },
        items,
        page: Page {
            limit,
            offset,
            total,
        },
    }))
}

/// GET /api/anchors/:id - Anchor with on-chain, receipt and verification details.
pub async fn get_anchor(
    State(state): State<AppState>,
    caller: Caller,
    Path(anchor_id): Path<i64>,
) -> Result<Json<ProofBundle>, ApiError> {
    ensure(&state, &caller, Capability::LedgerRead)?;
    Ok(Json(state.publisher.anchor_detail(anchor_id).await?))
}

/// GET /api/anchors/:id/proof-bundle - Offline-verifiable proof bundle.
pub async fn get_proof_bundle(
    State(state): State<AppState>,
    caller: Caller,
    Path(anchor_id): Path<i64>,
) -> Result<Json<ProofBundle>, ApiError> {
    ensure(&state, &caller, Capability::LedgerRead)?;
    Ok(Json(state.publisher.build_proof_bundle(anchor_id).await?))
}

/// POST /api/anchors/:id/publish - Submit the anchor's root on-chain.
pub async fn publish_anchor(
    State(state): State<AppState>,
    caller: Caller,
    Path(anchor_id): Path<i64>,
) -> Result<Json<PublishOutcome>, ApiError> {
    ensure(&state, &caller, Capability::AnchorPublish)?;

    let outcome = state.publisher.publish(anchor_id).await?;
    state.metrics.inc_counter(metric_names::ANCHORS_PUBLISHED).await;
    Ok(Json(outcome))
}

/// POST /api/anchors/:id/confirm - Wait for the anchor's transaction receipt.
pub async fn confirm_anchor(
    State(state): State<AppState>,
    caller: Caller,
    Path(anchor_id): Path<i64>,
) -> Result<Json<ConfirmOutcome>, ApiError> {
    ensure(&state, &caller, Capability::AnchorPublish)?;

    let outcome = state.publisher.confirm(anchor_id).await?;
    match &outcome {
        ConfirmOutcome::Confirmed(_) => {
            state.metrics.inc_counter(metric_names::ANCHORS_CONFIRMED).await
        }
        ConfirmOutcome::Failed(_) => state.metrics.inc_counter(metric_names::ANCHORS_FAILED).await,
        ConfirmOutcome::StillPending(_) | ConfirmOutcome::AlreadyConfirmed(_) => {}
    }
    Ok(Json(outcome))
}
