//! Ledger event record and the typed payload registry
//!
//! The ledger itself treats payloads as JSON objects. `EventPayload` gives
//! consumers a typed view for the event types the host application emits,
//! with an opaque fallback so unknown types never fail to decode.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum length of an event type
pub const MAX_EVENT_TYPE_LEN: usize = 64;

/// One persisted, hash-chained ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Monotonic id assigned by the store
    pub id: i64,
    pub event_type: String,
    /// Canonical JSON text of the payload object, exactly as hashed
    pub payload_json: String,
    pub prev_hash: Option<String>,
    pub block_hash: String,
    /// RFC 3339 UTC with microseconds; hashed verbatim
    pub created_at: String,
    pub actor_id: Option<i64>,
}

impl LedgerEvent {
    /// Decode the stored payload
    pub fn payload(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.payload_json)
    }
}

/// An event ready for insertion (hash already computed)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEvent {
    pub event_type: String,
    pub payload_json: String,
    pub prev_hash: Option<String>,
    pub block_hash: String,
    pub created_at: String,
    pub actor_id: Option<i64>,
    /// Subject link, derived from the payload; not part of the hash
    pub subject: Option<Subject>,
}

/// The entity an evidence export is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub entity_type: String,
    pub entity_id: String,
}

impl Subject {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Subject named by a payload's `entity_type` / `entity_id` fields.
    ///
    /// Numeric ids are accepted and rendered in decimal.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let entity_type = payload.get("entity_type")?.as_str()?;
        let entity_id = match payload.get("entity_id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        if entity_type.is_empty() || entity_id.is_empty() {
            return None;
        }
        Some(Self::new(entity_type, entity_id))
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Check the event type shape: 1-64 chars of `[a-z0-9_.:-]`.
pub fn validate_event_type(event_type: &str) -> Result<(), String> {
    if event_type.is_empty() {
        return Err("event_type must not be empty".to_string());
    }
    if event_type.chars().count() > MAX_EVENT_TYPE_LEN {
        return Err(format!(
            "event_type must be at most {MAX_EVENT_TYPE_LEN} characters"
        ));
    }
    if let Some(bad) = event_type
        .chars()
        .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '_' | '.' | ':' | '-'))
    {
        return Err(format!("event_type contains invalid character {bad:?}"));
    }
    Ok(())
}

// ============================================================================
// Payload Registry
// ============================================================================

/// Inspection workflow state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionTransition {
    pub entity_type: String,
    pub entity_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_status: Option<String>,
    pub to_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// User account created, updated or deactivated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserChanged {
    pub entity_type: String,
    pub entity_id: Value,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Map<String, Value>>,
}

/// Material movement in TMC tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TmcMovement {
    pub entity_type: String,
    pub entity_id: Value,
    pub movement: String,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_location: Option<String>,
}

/// Typed view of a ledger payload, keyed by event type
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    InspectionTransition(InspectionTransition),
    UserChanged(UserChanged),
    TmcMovement(TmcMovement),
    Opaque(Map<String, Value>),
}

impl EventPayload {
    pub const INSPECTION_TRANSITION: &'static str = "inspection.transition";
    pub const USER_CHANGED: &'static str = "user.changed";
    pub const TMC_MOVEMENT: &'static str = "tmc.movement";

    /// Whether `event_type` has a registered schema
    pub fn is_known(event_type: &str) -> bool {
        matches!(
            event_type,
            Self::INSPECTION_TRANSITION | Self::USER_CHANGED | Self::TMC_MOVEMENT
        )
    }

    /// Decode a payload object; known types must match their schema.
    pub fn decode(event_type: &str, payload: &Value) -> Result<Self, String> {
        let Value::Object(map) = payload else {
            return Err("payload must be a JSON object".to_string());
        };

        let typed = |e: serde_json::Error| format!("invalid {event_type} payload: {e}");
        match event_type {
            Self::INSPECTION_TRANSITION => serde_json::from_value(payload.clone())
                .map(Self::InspectionTransition)
                .map_err(typed),
            Self::USER_CHANGED => serde_json::from_value(payload.clone())
                .map(Self::UserChanged)
                .map_err(typed),
            Self::TMC_MOVEMENT => serde_json::from_value(payload.clone())
                .map(Self::TmcMovement)
                .map_err(typed),
            _ => Ok(Self::Opaque(map.clone())),
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque(_))
    }
}
