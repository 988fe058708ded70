//! SQLite anchor store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, FromRow};

use crate::domain::{
    format_timestamp, Anchor, AnchorConfirmation, AnchorFilter, AnchorPeriod, AnchorStatus,
    AnchorSubmission, NewAnchor,
};
use crate::infra::{transition_refused, AnchorStore, LedgerError, Result};

use super::{parse_column, parse_optional_column};

const ANCHOR_COLUMNS: &str = r#"
    id, period_start, period_end, events_count, merkle_root, status,
    network, chain_id, contract_address, tx_hash, block_number, log_index,
    anchored_at, created_at, submitted_at, failure_reason
"#;

/// SQLite-backed anchor store
#[derive(Clone)]
pub struct SqliteAnchorStore {
    pool: SqlitePool,
}

impl SqliteAnchorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: i64) -> Result<Anchor> {
        self.get(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("anchor", id))
    }

    /// Why a guarded update matched no row
    async fn conflict(&self, id: i64, transition: &str) -> LedgerError {
        match self.get(id).await {
            Ok(Some(anchor)) => transition_refused(&anchor, transition),
            Ok(None) => LedgerError::not_found("anchor", id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl AnchorStore for SqliteAnchorStore {
    async fn create(&self, anchor: NewAnchor) -> Result<Anchor> {
        let (period_start, period_end) = anchor.period.bounds();

        let result = sqlx::query(
            r#"
            INSERT INTO ledger_anchors (
                period_start, period_end, events_count, merkle_root, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&period_start)
        .bind(&period_end)
        .bind(anchor.events_count)
        .bind(&anchor.merkle_root)
        .bind(anchor.status.as_str())
        .bind(format_timestamp(anchor.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(result) => self.fetch(result.last_insert_rowid()).await,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(LedgerError::DuplicatePeriod {
                    period_start,
                    period_end,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: i64) -> Result<Option<Anchor>> {
        let row = sqlx::query_as::<_, AnchorRow>(&format!(
            "SELECT {ANCHOR_COLUMNS} FROM ledger_anchors WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Anchor::try_from).transpose()
    }

    async fn live_for_period(&self, period: &AnchorPeriod) -> Result<Option<Anchor>> {
        let (start, end) = period.bounds();
        let row = sqlx::query_as::<_, AnchorRow>(&format!(
            r#"
            SELECT {ANCHOR_COLUMNS} FROM ledger_anchors
            WHERE period_start = ? AND period_end = ?
              AND status IN ('empty', 'pending', 'confirmed')
            LIMIT 1
            "#
        ))
        .bind(start)
        .bind(end)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Anchor::try_from).transpose()
    }

    async fn for_period(&self, period: &AnchorPeriod) -> Result<Vec<Anchor>> {
        let (start, end) = period.bounds();
        let rows = sqlx::query_as::<_, AnchorRow>(&format!(
            r#"
            SELECT {ANCHOR_COLUMNS} FROM ledger_anchors
            WHERE period_start = ? AND period_end = ?
            ORDER BY id DESC
            "#
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Anchor::try_from).collect()
    }

    async fn list(&self, filter: &AnchorFilter) -> Result<(Vec<Anchor>, i64)> {
        let from = filter.from.map(format_timestamp);
        let to = filter.to.map(format_timestamp);
        let status = filter.status.map(|s| s.as_str());

        let where_clause = r#"
            WHERE (? IS NULL OR period_start >= ?)
              AND (? IS NULL OR period_start < ?)
              AND (? IS NULL OR status = ?)
        "#;

        let (total,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM ledger_anchors {where_clause}"))
                .bind(&from)
                .bind(&from)
                .bind(&to)
                .bind(&to)
                .bind(status)
                .bind(status)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query_as::<_, AnchorRow>(&format!(
            r#"
            SELECT {ANCHOR_COLUMNS} FROM ledger_anchors
            {where_clause}
            ORDER BY period_start DESC, id DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(&from)
        .bind(&from)
        .bind(&to)
        .bind(&to)
        .bind(status)
        .bind(status)
        .bind(filter.limit.max(0))
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        let anchors = rows
            .into_iter()
            .map(Anchor::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((anchors, total))
    }

    async fn claim_for_publish(
        &self,
        id: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Anchor> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_anchors
            SET publish_claimed_until = ?
            WHERE id = ? AND status = 'pending' AND tx_hash IS NULL
              AND (publish_claimed_until IS NULL OR publish_claimed_until <= ?)
            "#,
        )
        .bind(format_timestamp(lease_until))
        .bind(id)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, "claimed for publishing").await);
        }
        self.fetch(id).await
    }

    async fn release_claim(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE ledger_anchors SET publish_claimed_until = NULL \
             WHERE id = ? AND tx_hash IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_submission(&self, id: i64, submission: &AnchorSubmission) -> Result<Anchor> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_anchors
            SET tx_hash = ?, network = ?, chain_id = ?, contract_address = ?, submitted_at = ?,
                publish_claimed_until = NULL
            WHERE id = ? AND status = 'pending' AND tx_hash IS NULL
            "#,
        )
        .bind(&submission.tx_hash)
        .bind(&submission.network)
        .bind(submission.chain_id)
        .bind(&submission.contract_address)
        .bind(format_timestamp(submission.submitted_at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, "submitted").await);
        }
        self.fetch(id).await
    }

    async fn mark_confirmed(
        &self,
        id: i64,
        tx_hash: &str,
        confirmation: &AnchorConfirmation,
    ) -> Result<Anchor> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_anchors
            SET status = 'confirmed', block_number = ?, log_index = ?, anchored_at = ?
            WHERE id = ? AND status = 'pending' AND tx_hash = ?
            "#,
        )
        .bind(confirmation.block_number)
        .bind(confirmation.log_index)
        .bind(format_timestamp(confirmation.anchored_at))
        .bind(id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, "confirmed").await);
        }
        self.fetch(id).await
    }

    async fn mark_failed(&self, id: i64, tx_hash: &str, reason: &str) -> Result<Anchor> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_anchors
            SET status = 'failed', failure_reason = ?
            WHERE id = ? AND status = 'pending' AND tx_hash = ?
            "#,
        )
        .bind(reason)
        .bind(id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, "failed").await);
        }
        self.fetch(id).await
    }
}

#[derive(Debug, FromRow)]
struct AnchorRow {
    id: i64,
    period_start: String,
    period_end: String,
    events_count: i64,
    merkle_root: Option<String>,
    status: String,
    network: Option<String>,
    chain_id: Option<i64>,
    contract_address: Option<String>,
    tx_hash: Option<String>,
    block_number: Option<i64>,
    log_index: Option<i64>,
    anchored_at: Option<String>,
    created_at: String,
    submitted_at: Option<String>,
    failure_reason: Option<String>,
}

impl TryFrom<AnchorRow> for Anchor {
    type Error = LedgerError;

    fn try_from(row: AnchorRow) -> Result<Self> {
        let status: AnchorStatus = row.status.parse().map_err(LedgerError::Internal)?;

        Ok(Self {
            id: row.id,
            period_start: parse_column("period_start", &row.period_start)?,
            period_end: parse_column("period_end", &row.period_end)?,
            events_count: row.events_count,
            merkle_root: row.merkle_root,
            status,
            network: row.network,
            chain_id: row.chain_id,
            contract_address: row.contract_address,
            tx_hash: row.tx_hash,
            block_number: row.block_number,
            log_index: row.log_index,
            anchored_at: parse_optional_column("anchored_at", row.anchored_at)?,
            created_at: parse_column("created_at", &row.created_at)?,
            submitted_at: parse_optional_column("submitted_at", row.submitted_at)?,
            failure_reason: row.failure_reason,
        })
    }
}
