//! Structured API error responses with error codes
//!
//! Every handler failure is rendered as `{"error": {code, numeric_code, message, ...}}`
//! with the code also echoed in the `x-error-code` header. Internal failures are
//! logged and reported with a fixed message.

use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::anchor::{ConfirmError, Missing, PublishError};
use crate::evidence::EvidenceError;
use crate::infra::LedgerError;
use crate::verification::VerificationError;

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes for API responses
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Access (1xxx)
    /// The caller lacks the capability for this operation
    InsufficientPermissions,

    // Rate limiting (2xxx)
    RateLimitExceeded,

    // Validation (3xxx)
    InvalidRequestBody,
    InvalidFieldValue,

    // Resources (4xxx)
    ResourceNotFound,
    EventNotFound,
    AnchorNotFound,

    // State (7xxx)
    /// The anchor is not in a state that allows the operation
    InvalidAnchorState,

    // Infrastructure (8xxx)
    ServiceUnavailable,
    InternalError,

    // Anchoring (9xxx)
    /// Publishing is switched off
    AnchorPublishingDisabled,
    /// Chain settings are incomplete
    AnchorNotConfigured,
    /// The chain RPC failed; the anchor is unchanged
    ChainUnavailable,

    // Evidence (10xxx)
    SigningUnavailable,
    SigningKeyRevoked,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn numeric_code(&self) -> u32 {
        match self {
            ErrorCode::InsufficientPermissions => 1005,
            ErrorCode::RateLimitExceeded => 2001,
            ErrorCode::InvalidRequestBody => 3001,
            ErrorCode::InvalidFieldValue => 3003,
            ErrorCode::ResourceNotFound => 4001,
            ErrorCode::EventNotFound => 4002,
            ErrorCode::AnchorNotFound => 4006,
            ErrorCode::InvalidAnchorState => 7001,
            ErrorCode::ServiceUnavailable => 8002,
            ErrorCode::InternalError => 8999,
            ErrorCode::AnchorPublishingDisabled => 9000,
            ErrorCode::AnchorNotConfigured => 9001,
            ErrorCode::ChainUnavailable => 9002,
            ErrorCode::SigningUnavailable => 10001,
            ErrorCode::SigningKeyRevoked => 10002,
        }
    }

    /// Get the HTTP status code for this error
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::InsufficientPermissions => StatusCode::FORBIDDEN,
            ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InvalidRequestBody | ErrorCode::InvalidFieldValue => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::ResourceNotFound | ErrorCode::EventNotFound | ErrorCode::AnchorNotFound => {
                StatusCode::NOT_FOUND
            }
            ErrorCode::InvalidAnchorState => StatusCode::CONFLICT,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::AnchorPublishingDisabled => StatusCode::CONFLICT,
            ErrorCode::AnchorNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ChainUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::SigningUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::SigningKeyRevoked => StatusCode::CONFLICT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::EventNotFound => "EVENT_NOT_FOUND",
            ErrorCode::AnchorNotFound => "ANCHOR_NOT_FOUND",
            ErrorCode::InvalidAnchorState => "INVALID_ANCHOR_STATE",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::AnchorPublishingDisabled => "ANCHOR_PUBLISHING_DISABLED",
            ErrorCode::AnchorNotConfigured => "ANCHOR_NOT_CONFIGURED",
            ErrorCode::ChainUnavailable => "CHAIN_UNAVAILABLE",
            ErrorCode::SigningUnavailable => "SIGNING_UNAVAILABLE",
            ErrorCode::SigningKeyRevoked => "SIGNING_KEY_REVOKED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Structured error response for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetails,
}

/// Detailed error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code for easy categorization
    pub numeric_code: u32,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Seconds until the caller may retry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                message: message.into(),
                details: None,
                retry_after: None,
                resource_id: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.error.retry_after = Some(seconds);
        self
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.error.resource_id = Some(id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.error.code.as_str();
        let retry_after = self.error.retry_after;
        let mut response = (status, Json(self)).into_response();

        let headers = response.headers_mut();
        headers.insert(
            header::HeaderName::from_static("x-error-code"),
            HeaderValue::from_static(code),
        );
        if let Some(seconds) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }

        response
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(ErrorCode::InvalidRequestBody, rejection.body_text())
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { kind, id } => {
                let code = match kind {
                    "event" => ErrorCode::EventNotFound,
                    "anchor" => ErrorCode::AnchorNotFound,
                    _ => ErrorCode::ResourceNotFound,
                };
                ApiError::new(code, format!("{kind} not found: {id}")).with_resource_id(id)
            }
            LedgerError::Validation(msg) => ApiError::new(ErrorCode::InvalidFieldValue, msg),
            LedgerError::InvalidState(msg) => ApiError::new(ErrorCode::InvalidAnchorState, msg),
            other => {
                tracing::error!(error = %other, "Request failed");
                internal_error()
            }
        }
    }
}

fn precondition(missing: Missing) -> ApiError {
    let code = match missing {
        Missing::PublishingDisabled => ErrorCode::AnchorPublishingDisabled,
        _ => ErrorCode::AnchorNotConfigured,
    };
    ApiError::new(code, missing.to_string()).with_details(serde_json::json!({
        "missing": missing,
    }))
}

fn anchor_not_found(id: i64) -> ApiError {
    ApiError::new(ErrorCode::AnchorNotFound, format!("anchor not found: {id}"))
        .with_resource_id(id.to_string())
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Precondition(missing) => precondition(missing),
            PublishError::NotFound(id) => anchor_not_found(id),
            PublishError::InvalidState(msg) => ApiError::new(ErrorCode::InvalidAnchorState, msg),
            PublishError::Chain(e) => {
                tracing::error!(error = %e, "Anchor publish failed at the chain");
                ApiError::new(ErrorCode::ChainUnavailable, "chain request failed")
            }
            PublishError::Store(e) => e.into(),
        }
    }
}

impl From<ConfirmError> for ApiError {
    fn from(err: ConfirmError) -> Self {
        match err {
            ConfirmError::Precondition(missing) => precondition(missing),
            ConfirmError::NotFound(id) => anchor_not_found(id),
            ConfirmError::InvalidState(msg) => ApiError::new(ErrorCode::InvalidAnchorState, msg),
            ConfirmError::Chain(e) => {
                tracing::error!(error = %e, "Anchor confirmation failed at the chain");
                ApiError::new(ErrorCode::ChainUnavailable, "chain request failed")
            }
            ConfirmError::Store(e) => e.into(),
        }
    }
}

impl From<EvidenceError> for ApiError {
    fn from(err: EvidenceError) -> Self {
        match err {
            EvidenceError::SigningUnavailable => ApiError::new(
                ErrorCode::SigningUnavailable,
                "export signing key is not configured",
            ),
            EvidenceError::SigningKeyRevoked(key_id) => ApiError::new(
                ErrorCode::SigningKeyRevoked,
                format!("export signing key {key_id} is revoked"),
            )
            .with_resource_id(key_id),
            EvidenceError::Store(e) => e.into(),
            other => {
                tracing::error!(error = %other, "Evidence request failed");
                internal_error()
            }
        }
    }
}

impl From<VerificationError> for ApiError {
    fn from(err: VerificationError) -> Self {
        match err {
            VerificationError::RateLimited { retry_after_secs } => rate_limited(retry_after_secs),
            VerificationError::Store(e) => e.into(),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Create a validation error with field details
pub fn validation_error(field: &str, message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InvalidFieldValue, message.into()).with_details(serde_json::json!({
        "field": field
    }))
}

pub fn rate_limited(retry_after_seconds: u64) -> ApiError {
    ApiError::new(ErrorCode::RateLimitExceeded, "Rate limit exceeded")
        .with_retry_after(retry_after_seconds)
}

pub fn forbidden(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InsufficientPermissions, message.into())
}

pub fn internal_error() -> ApiError {
    ApiError::new(ErrorCode::InternalError, "internal error")
}

// ============================================================================
// Tests
// ============================================================================
