//! Process configuration, read once from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::anchor::AnchorConfig;
use crate::infra::{LedgerError, Result, RetryPolicy};

/// Server and CLI configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL.
    pub database_url: String,
    /// Server listen address.
    pub listen_addr: SocketAddr,
    /// Maximum database connections.
    pub max_connections: u32,
    /// NDJSON file receiving appends that could not be written.
    pub dead_letter_path: PathBuf,
    /// Directory of confirmed-anchor receipt files.
    pub receipts_dir: PathBuf,
    /// Attempts per append, including the first.
    pub append_max_attempts: u32,
    pub anchor: AnchorConfig,
    /// PKCS#8 PEM or 32-byte hex Ed25519 key for signing exports.
    pub export_signing_key_path: Option<PathBuf>,
    pub verify_rate_limit_per_minute: u32,
    /// Comma-separated origins, or `*`.
    pub cors_allow_origins: Option<String>,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let host = env_or("HOST", "0.0.0.0");
        let port: u16 = env_parse("PORT", 8080);
        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| LedgerError::Configuration(format!("invalid listen address: {e}")))?;

        Ok(Self {
            database_url: env_or("DATABASE_URL", "sqlite://mro-ledger.db?mode=rwc"),
            listen_addr,
            max_connections: env_parse("MAX_DB_CONNECTIONS", 5),
            dead_letter_path: env_or("DEAD_LETTER_PATH", "data/ledger-dead-letter.ndjson").into(),
            receipts_dir: env_or("RECEIPTS_DIR", "data/anchor-receipts").into(),
            append_max_attempts: env_parse("APPEND_MAX_ATTEMPTS", 5u32).max(1),
            anchor: AnchorConfig::from_env(),
            export_signing_key_path: std::env::var("EXPORT_SIGNING_KEY_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            verify_rate_limit_per_minute: env_parse("VERIFY_RATE_LIMIT_PER_MINUTE", 30),
            cors_allow_origins: std::env::var("CORS_ALLOW_ORIGINS")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        })
    }

    /// Retry policy for the append path
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.append_max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("MRO_LEDGER_TEST_PARSE", "not-a-number");
        assert_eq!(env_parse("MRO_LEDGER_TEST_PARSE", 7u32), 7);
        std::env::set_var("MRO_LEDGER_TEST_PARSE", " 12 ");
        assert_eq!(env_parse("MRO_LEDGER_TEST_PARSE", 7u32), 12);
        std::env::remove_var("MRO_LEDGER_TEST_PARSE");
        assert_eq!(env_parse("MRO_LEDGER_TEST_PARSE", 7u32), 7);
    }

    #[test]
    fn test_retry_policy_uses_configured_attempts() {
        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 1,
            dead_letter_path: "dl.ndjson".into(),
            receipts_dir: "receipts".into(),
            append_max_attempts: 3,
            anchor: AnchorConfig::default(),
            export_signing_key_path: None,
            verify_rate_limit_per_minute: 30,
            cors_allow_origins: None,
        };
        assert_eq!(config.retry_policy().max_attempts, 3);
    }
}
