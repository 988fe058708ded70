//! SQLite ledger event store

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, FromRow};

use crate::domain::{AnchorPeriod, LedgerEvent, NewLedgerEvent, Subject};
use crate::infra::{LedgerError, LedgerStore, Result};

const EVENT_COLUMNS: &str =
    "id, event_type, payload_json, prev_hash, block_hash, created_at, actor_id";

/// SQLite-backed ledger store
#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ledger_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn tail(&self) -> Result<Option<LedgerEvent>> {
        let row = sqlx::query_as::<_, LedgerEventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM ledger_events ORDER BY id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert(&self, event: NewLedgerEvent) -> Result<LedgerEvent> {
        let (entity_type, entity_id) = match &event.subject {
            Some(s) => (Some(s.entity_type.as_str()), Some(s.entity_id.as_str())),
            None => (None, None),
        };

        // Conditional on the tail: `IS` compares NULL to NULL as true, which
        // covers the genesis insert into an empty table.
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_events (
                event_type, payload_json, prev_hash, block_hash,
                created_at, actor_id, entity_type, entity_id
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?
            WHERE (SELECT block_hash FROM ledger_events ORDER BY id DESC LIMIT 1) IS ?
            "#,
        )
        .bind(&event.event_type)
        .bind(&event.payload_json)
        .bind(&event.prev_hash)
        .bind(&event.block_hash)
        .bind(&event.created_at)
        .bind(event.actor_id)
        .bind(entity_type)
        .bind(entity_id)
        .bind(&event.prev_hash)
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(result) => result,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(LedgerError::Contention);
            }
            Err(e) => return Err(e.into()),
        };

        if result.rows_affected() == 0 {
            return Err(LedgerError::Contention);
        }

        Ok(LedgerEvent {
            id: result.last_insert_rowid(),
            event_type: event.event_type,
            payload_json: event.payload_json,
            prev_hash: event.prev_hash,
            block_hash: event.block_hash,
            created_at: event.created_at,
            actor_id: event.actor_id,
        })
    }

    async fn get(&self, id: i64) -> Result<Option<LedgerEvent>> {
        let row = sqlx::query_as::<_, LedgerEventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM ledger_events WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn range(&self, from_id: Option<i64>, to_id: Option<i64>) -> Result<Vec<LedgerEvent>> {
        let rows = sqlx::query_as::<_, LedgerEventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM ledger_events
            WHERE (? IS NULL OR id >= ?)
              AND (? IS NULL OR id <= ?)
            ORDER BY id ASC
            "#
        ))
        .bind(from_id)
        .bind(from_id)
        .bind(to_id)
        .bind(to_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn predecessor(&self, id: i64) -> Result<Option<LedgerEvent>> {
        let row = sqlx::query_as::<_, LedgerEventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM ledger_events WHERE id < ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn in_period(&self, period: &AnchorPeriod) -> Result<Vec<LedgerEvent>> {
        let (start, end) = period.bounds();
        let rows = sqlx::query_as::<_, LedgerEventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM ledger_events
            WHERE created_at >= ? AND created_at < ?
              AND block_hash IS NOT NULL AND block_hash <> ''
            ORDER BY id ASC
            "#
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn for_subject(&self, subject: &Subject) -> Result<Vec<LedgerEvent>> {
        let rows = sqlx::query_as::<_, LedgerEventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM ledger_events
            WHERE entity_type = ? AND entity_id = ?
            ORDER BY id ASC
            "#
        ))
        .bind(&subject.entity_type)
        .bind(&subject.entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, FromRow)]
struct LedgerEventRow {
    id: i64,
    event_type: String,
    payload_json: String,
    prev_hash: Option<String>,
    block_hash: String,
    created_at: String,
    actor_id: Option<i64>,
}

impl From<LedgerEventRow> for LedgerEvent {
    fn from(row: LedgerEventRow) -> Self {
        Self {
            id: row.id,
            event_type: row.event_type,
            payload_json: row.payload_json,
            prev_hash: row.prev_hash,
            block_hash: row.block_hash,
            created_at: row.created_at,
            actor_id: row.actor_id,
        }
    }
}
