//! SQLite export signing key registry

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqlitePool, FromRow};

use crate::domain::{format_timestamp, KeyRecord};
use crate::infra::{KeyRegistry, LedgerError, Result};

use super::{parse_column, parse_optional_column};

/// SQLite-backed key registry
#[derive(Clone)]
pub struct SqliteKeyRegistry {
    pool: SqlitePool,
}

impl SqliteKeyRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyRegistry for SqliteKeyRegistry {
    async fn get(&self, key_id: &str) -> Result<Option<KeyRecord>> {
        let row = sqlx::query_as::<_, KeyRow>(
            r#"
            SELECT key_id, public_key, is_active, is_revoked, revocation_reason,
                   created_at, revoked_at
            FROM export_signing_keys
            WHERE key_id = ?
            "#,
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(KeyRecord::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<KeyRecord>> {
        let rows = sqlx::query_as::<_, KeyRow>(
            r#"
            SELECT key_id, public_key, is_active, is_revoked, revocation_reason,
                   created_at, revoked_at
            FROM export_signing_keys
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(KeyRecord::try_from).collect()
    }

    async fn register(&self, record: KeyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO export_signing_keys (
                key_id, public_key, is_active, is_revoked, revocation_reason,
                created_at, revoked_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (key_id) DO NOTHING
            "#,
        )
        .bind(&record.key_id)
        .bind(&record.public_key)
        .bind(record.is_active)
        .bind(record.is_revoked)
        .bind(&record.revocation_reason)
        .bind(format_timestamp(record.created_at))
        .bind(record.revoked_at.map(format_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn activate(&self, key_id: &str) -> Result<()> {
        let record = self
            .get(key_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("key", key_id))?;
        if record.is_revoked {
            return Err(LedgerError::Validation(format!(
                "key {key_id} is revoked and cannot be activated"
            )));
        }

        // Single statement, so at most one key is ever active
        sqlx::query("UPDATE export_signing_keys SET is_active = (key_id = ?)")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke(&self, key_id: &str, reason: &str) -> Result<KeyRecord> {
        let result = sqlx::query(
            r#"
            UPDATE export_signing_keys
            SET is_revoked = 1, is_active = 0, revocation_reason = ?, revoked_at = ?
            WHERE key_id = ?
            "#,
        )
        .bind(reason)
        .bind(format_timestamp(Utc::now()))
        .bind(key_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("key", key_id));
        }
        self.get(key_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("key", key_id))
    }
}

#[derive(Debug, FromRow)]
struct KeyRow {
    key_id: String,
    public_key: String,
    is_active: bool,
    is_revoked: bool,
    revocation_reason: Option<String>,
    created_at: String,
    revoked_at: Option<String>,
}

impl TryFrom<KeyRow> for KeyRecord {
    type Error = LedgerError;

    fn try_from(row: KeyRow) -> Result<Self> {
        Ok(Self {
            key_id: row.key_id,
            public_key: row.public_key,
            is_active: row.is_active,
            is_revoked: row.is_revoked,
            revocation_reason: row.revocation_reason,
            created_at: parse_column("created_at", &row.created_at)?,
            revoked_at: parse_optional_column("revoked_at", row.revoked_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::sqlite::test_pool;

    #[tokio::test]
    async fn test_register_activate_revoke() {
        let registry = SqliteKeyRegistry::new(test_pool().await);

        registry
            .register(KeyRecord::new("aaaa", "pem-a", Utc::now()))
            .await
            .unwrap();
        registry
            .register(KeyRecord::new("bbbb", "pem-b", Utc::now()))
            .await
            .unwrap();
        // Re-registering is a no-op
        registry
            .register(KeyRecord::new("aaaa", "other", Utc::now()))
            .await
            .unwrap();

        registry.activate("aaaa").await.unwrap();
        registry.activate("bbbb").await.unwrap();

        let keys = registry.list().await.unwrap();
        assert_eq!(keys.len(), 2);
        let a = registry.get("aaaa").await.unwrap().unwrap();
        assert_eq!(a.public_key, "pem-a");
        assert!(!a.is_active);
        assert!(registry.get("bbbb").await.unwrap().unwrap().is_active);

        let revoked = registry.revoke("bbbb", "key compromised").await.unwrap();
        assert!(revoked.is_revoked);
        assert!(!revoked.is_active);
        assert_eq!(revoked.revocation_reason.as_deref(), Some("key compromised"));
        assert!(revoked.revoked_at.is_some());

        assert!(matches!(
            registry.revoke("missing", "x").await,
            Err(LedgerError::NotFound { .. })
        ));
        assert!(registry.activate("bbbb").await.is_err());
    }
}
