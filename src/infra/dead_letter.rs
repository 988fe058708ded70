//! Dead-letter file for ledger appends that exhausted their retries
//!
//! Entries are newline-delimited JSON. The recorder appends; the replayer moves
//! the file aside, re-submits it and appends the failures back. Malformed lines
//! are dropped by a replay. Recording never fails the caller: the append that
//! triggered it has already failed and is reported on its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::domain::format_timestamp;
use crate::infra::Result;

/// Error recorded for a payload that is neither an object nor a JSON-encoded object
pub const INVALID_PAYLOAD_JSON: &str = "Invalid payload_json";

/// A replay batch untouched this long belongs to a run that died
const STALE_BATCH_AGE: Duration = Duration::from_secs(60 * 60);

/// One failed append
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event_type: String,
    /// JSON object, or a string holding one
    pub payload: Value,
    pub actor_id: Option<i64>,
    pub error: String,
    pub ts_utc: String,
}

impl DeadLetterEntry {
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        actor_id: Option<i64>,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            actor_id,
            error: error.into(),
            ts_utc: format_timestamp(at),
        }
    }

    /// The payload object to re-submit
    pub fn resolve_payload(&self) -> std::result::Result<Value, String> {
        match &self.payload {
            Value::Object(_) => Ok(self.payload.clone()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(decoded @ Value::Object(_)) => Ok(decoded),
                _ => Err(INVALID_PAYLOAD_JSON.to_string()),
            },
            _ => Err(INVALID_PAYLOAD_JSON.to_string()),
        }
    }
}

/// Queue depth summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub entries: usize,
    pub oldest_ts_utc: Option<String>,
}

/// Outcome of a replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// Append path used by replay; must not dead-letter on failure.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplayAppender: Send + Sync {
    /// Append and return the block hash, or a displayable failure
    async fn append_for_replay(
        &self,
        event_type: &str,
        payload: Value,
        actor_id: Option<i64>,
    ) -> std::result::Result<String, String>;
}

/// File-backed dead-letter queue
#[derive(Debug)]
pub struct DeadLetterQueue {
    path: PathBuf,
    replay_lock: Mutex<()>,
}

impl DeadLetterQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            replay_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Failures are logged and swallowed.
    pub async fn record(&self, entry: &DeadLetterEntry) {
        if let Err(e) = self.append_lines(std::slice::from_ref(entry)).await {
            tracing::error!(
                path = %self.path.display(),
                event_type = %entry.event_type,
                error = %e,
                "Failed to record dead-letter entry"
            );
        } else {
            tracing::warn!(
                event_type = %entry.event_type,
                error = %entry.error,
                "Ledger append dead-lettered"
            );
        }
    }

    /// Parse NDJSON, skipping lines that are not usable entries.
    pub fn parse(raw: &str) -> Vec<DeadLetterEntry> {
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(index, line)| {
                let entry = parse_line(line);
                if entry.is_none() {
                    tracing::warn!(line = index + 1, "Skipping malformed dead-letter line");
                }
                entry
            })
            .collect()
    }

    /// Current entries; a missing file is an empty queue.
    pub async fn entries(&self) -> Result<Vec<DeadLetterEntry>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(Self::parse(&raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn stats(&self) -> Result<DeadLetterStats> {
        let entries = self.entries().await?;
        Ok(DeadLetterStats {
            entries: entries.len(),
            oldest_ts_utc: entries
                .iter()
                .map(|e| e.ts_utc.as_str())
                .filter(|ts| !ts.is_empty())
                .min()
                .map(str::to_string),
        })
    }

    /// Re-submit every entry in file order, then keep only the failures.
    ///
    /// The live file is renamed to a per-run batch first, so entries recorded
    /// meanwhile (by this or another process) land in a fresh live file.
    /// Failures are appended back to it rather than overwriting it.
    pub async fn replay(&self, appender: &dyn ReplayAppender) -> Result<ReplayReport> {
        let _guard = self.replay_lock.lock().await;

        let mut batches = self.adopt_stale_batches().await?;
        if let Some(batch) = self.take_batch(&self.path).await? {
            batches.push(batch);
        }
        if batches.is_empty() {
            return Ok(ReplayReport::default());
        }

        let mut read = Vec::with_capacity(batches.len());
        let mut entries = Vec::new();
        for batch in &batches {
            let raw = tokio::fs::read_to_string(batch).await?;
            // An unterminated last line may still be mid-write; leave it for the tail pass
            let mut complete = raw.rfind('\n').map_or(0, |i| i + 1);
            if parse_line(&raw[complete..]).is_some() {
                complete = raw.len();
            }
            entries.extend(Self::parse(&raw[..complete]));
            read.push(complete);
        }

        let mut report = ReplayReport::default();
        let mut remaining = Vec::new();

        for mut entry in entries {
            let outcome = match entry.resolve_payload() {
                Ok(payload) => {
                    appender
                        .append_for_replay(&entry.event_type, payload, entry.actor_id)
                        .await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(block_hash) => {
                    report.replayed += 1;
                    tracing::info!(
                        event_type = %entry.event_type,
                        block_hash = %block_hash,
                        "Replayed dead-letter entry"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        event_type = %entry.event_type,
                        error = %e,
                        "Dead-letter replay failed"
                    );
                    entry.error = e;
                    remaining.push(entry);
                }
            }
        }

        // A recorder that opened the live file just before the rename wrote into the batch
        for (batch, consumed) in batches.iter().zip(read) {
            let raw = tokio::fs::read_to_string(batch).await?;
            remaining.extend(Self::parse(raw.get(consumed..).unwrap_or_default()));
        }

        report.remaining = remaining.len();
        self.append_lines(&remaining).await?;
        for batch in &batches {
            tokio::fs::remove_file(batch).await?;
        }
        Ok(report)
    }

    fn batch_prefix(&self) -> String {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dead_letter".to_string());
        format!("{file_name}.replay-")
    }

    /// Rename `source` to a batch file owned by this run; `None` if it is gone.
    async fn take_batch(&self, source: &Path) -> Result<Option<PathBuf>> {
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let batch = self.path.with_file_name(format!(
            "{}{}-{stamp}",
            self.batch_prefix(),
            std::process::id()
        ));
        match tokio::fs::rename(source, &batch).await {
            Ok(()) => Ok(Some(batch)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Batches left behind by a replay that died, oldest first.
    async fn adopt_stale_batches(&self) -> Result<Vec<PathBuf>> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let mut listing = match tokio::fs::read_dir(&dir).await {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let prefix = self.batch_prefix();
        let mut stale = Vec::new();
        while let Some(item) = listing.next_entry().await? {
            if !item.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let modified = item.metadata().await?.modified()?;
            let age = modified.elapsed().unwrap_or_default();
            if age >= STALE_BATCH_AGE {
                stale.push((modified, item.path()));
            }
        }
        stale.sort();

        let mut adopted = Vec::new();
        for (_, path) in stale {
            if let Some(batch) = self.take_batch(&path).await? {
                tracing::warn!(batch = %path.display(), "Adopting abandoned dead-letter batch");
                adopted.push(batch);
            }
        }
        Ok(adopted)
    }

    /// All lines go out in a single append-mode write.
    async fn append_lines(&self, entries: &[DeadLetterEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut body = String::new();
        for entry in entries {
            body.push_str(&serde_json::to_string(entry)?);
            body.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<DeadLetterEntry> {
    let value: Value = serde_json::from_str(line).ok()?;
    let object = value.as_object()?;

    let event_type = object.get("event_type")?.as_str()?.to_string();
    let payload = match object.get("payload") {
        None | Some(Value::Null) => return None,
        Some(payload) => payload.clone(),
    };

    Some(DeadLetterEntry {
        event_type,
        payload,
        actor_id: object.get("actor_id").and_then(Value::as_i64),
        error: object
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        ts_utc: object
            .get("ts_utc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}
