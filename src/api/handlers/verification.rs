//! Aggregated verification handler.

use axum::extract::State;
use axum::Json;

use crate::api::error::ApiError;
use crate::server::AppState;
use crate::verification::{Caller, VerificationReport};

/// GET /api/verification - Authorization self-check plus full ledger verification.
pub async fn run_verification(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<VerificationReport>, ApiError> {
    Ok(Json(state.verification.run(&caller).await?))
}
