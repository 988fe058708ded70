//! SQLite implementations of the ledger, anchor and key stores
//!
//! All three stores share one pool. Timestamps are stored as RFC 3339 text
//! in the same microsecond `Z` form the ledger hashes, so string order is
//! time order.

mod anchors;
mod keys;
mod ledger;

pub use anchors::*;
pub use keys::*;
pub use ledger::*;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::domain::parse_timestamp;
use crate::infra::{LedgerError, Result};

/// Open a pool for `database_url`, creating the file if needed.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Open a pool and apply migrations
pub async fn connect_and_migrate(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let pool = connect(database_url, max_connections).await?;
    crate::migrations::run_sqlite(&pool)
        .await
        .map_err(|e| LedgerError::Configuration(format!("migration failed: {e}")))?;
    Ok(pool)
}

fn parse_column(column: &str, value: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(value)
        .ok_or_else(|| LedgerError::Internal(format!("Invalid {column}: {value}")))
}

fn parse_optional_column(column: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_column(column, &v)).transpose()
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::migrations::run_sqlite(&pool).await.unwrap();
    pool
}
