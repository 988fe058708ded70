//! Export signing key registry records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a registered key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Key is active and used for new signatures
    Active,
    /// Key is retired; its signatures still verify
    Inactive,
    /// Key has been revoked; its signatures are rejected
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Inactive => "inactive",
            KeyStatus::Revoked => "revoked",
        }
    }
}

/// A public key that has signed, or may sign, evidence exports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// First 16 hex chars of SHA-256 over the raw public key
    pub key_id: String,
    /// SPKI PEM
    pub public_key: String,
    pub is_active: bool,
    pub is_revoked: bool,
    pub revocation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    pub fn new(
        key_id: impl Into<String>,
        public_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            public_key: public_key.into(),
            is_active: false,
            is_revoked: false,
            revocation_reason: None,
            created_at: now,
            revoked_at: None,
        }
    }

    pub fn status(&self) -> KeyStatus {
        if self.is_revoked {
            KeyStatus::Revoked
        } else if self.is_active {
            KeyStatus::Active
        } else {
            KeyStatus::Inactive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revocation_dominates_status() {
        let mut record = KeyRecord::new("abcd", "pem", Utc::now());
        assert_eq!(record.status(), KeyStatus::Inactive);

        record.is_active = true;
        assert_eq!(record.status(), KeyStatus::Active);

        record.is_revoked = true;
        assert_eq!(record.status(), KeyStatus::Revoked);
        assert_eq!(record.status().as_str(), "revoked");
    }
}
