//! Caller identification and capability checks for REST API handlers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::error::{forbidden, validation_error, ApiError};
use crate::server::AppState;
use crate::verification::{Caller, Capability};

/// Header carrying the numeric id of the acting user
pub const ACTOR_HEADER: &str = "x-actor-id";

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(ACTOR_HEADER) else {
            return Ok(Caller::new(None));
        };
        value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|id| Caller::new(Some(id)))
            .ok_or_else(|| validation_error(ACTOR_HEADER, "x-actor-id must be an integer"))
    }
}

/// Ensure the caller holds `capability` under the configured access policy.
pub fn ensure(state: &AppState, caller: &Caller, capability: Capability) -> Result<(), ApiError> {
    if state.policy.allows(caller, capability) {
        return Ok(());
    }
    tracing::warn!(
        actor_id = ?caller.actor_id,
        capability = capability.as_str(),
        "Capability denied"
    );
    Err(forbidden(format!("{} permission required", capability.as_str())))
}
