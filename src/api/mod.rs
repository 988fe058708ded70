//! REST API for the MRO ledger
//!
//! Routes are nested under `/api`; `/health`, `/ready` and `/metrics` are
//! mounted at the root by the server.

pub mod auth_helpers;
pub mod error;
pub mod handlers;
pub mod types;

use axum::routing::{get, post};
use axum::Router;

use crate::server::AppState;

pub use auth_helpers::ACTOR_HEADER;
pub use error::{ApiError, ErrorCode};

/// Build the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ledger/events", post(handlers::append_event))
        .route("/ledger/events/:id/inclusion", get(handlers::event_inclusion))
        .route("/ledger/verify", get(handlers::verify_ledger))
        .route("/anchors", get(handlers::list_anchors))
        .route("/anchors/:id", get(handlers::get_anchor))
        .route("/anchors/:id/proof-bundle", get(handlers::get_proof_bundle))
        .route("/anchors/:id/publish", post(handlers::publish_anchor))
        .route("/anchors/:id/confirm", post(handlers::confirm_anchor))
        .route(
            "/evidence/:entity_type/:entity_id",
            get(handlers::export_evidence),
        )
        .route("/evidence/verify", post(handlers::verify_evidence))
        .route("/verification", get(handlers::run_verification))
}
