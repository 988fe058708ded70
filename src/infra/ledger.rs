//! Hash-chained, append-only ledger
//!
//! Every event binds its predecessor's block hash, its type, its timestamp,
//! its actor and its canonical payload. Appends are serialized in-process by
//! a mutex and across processes by the store's conditional tail insert.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::crypto::{canonicalize_json, compute_block_hash, BlockHashParams};
use crate::domain::{
    format_timestamp, validate_event_type, Clock, EventPayload, LedgerEvent, NewLedgerEvent,
    Subject, SystemClock,
};

use super::{
    DeadLetterEntry, DeadLetterQueue, LedgerError, LedgerStore, ReplayAppender, RetryPolicy,
};

// ============================================================================
// Errors
// ============================================================================

/// Why an append did not produce a block
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppendError {
    /// Rejected before hashing; nothing was written or dead-lettered
    #[error("validation failed: {0}")]
    Validation(String),

    /// The tail kept moving under us
    #[error("ledger contention after {attempts} attempts")]
    Contention { attempts: u32, dead_lettered: bool },

    /// The store failed
    #[error("storage error: {message}")]
    Storage { message: String, dead_lettered: bool },
}

impl AppendError {
    pub fn dead_lettered(&self) -> bool {
        match self {
            AppendError::Validation(_) => false,
            AppendError::Contention { dead_lettered, .. }
            | AppendError::Storage { dead_lettered, .. } => *dead_lettered,
        }
    }
}

/// What went wrong at a chain break
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainBreakReason {
    /// `prev_hash` does not point at the previous block
    PrevHashMismatch,
    /// Recomputed hash differs from the stored one
    BlockHashMismatch,
    /// Stored payload is not a JSON document
    InvalidPayload,
}

impl fmt::Display for ChainBreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainBreakReason::PrevHashMismatch => f.write_str("prev_hash mismatch"),
            ChainBreakReason::BlockHashMismatch => f.write_str("block_hash mismatch"),
            ChainBreakReason::InvalidPayload => f.write_str("payload is not valid JSON"),
        }
    }
}

/// First integrity violation found by [`verify_chain`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("chain break at index {index}")]
pub struct ChainBreak {
    /// Position within the verified slice
    pub index: usize,
    pub event_id: i64,
    pub reason: ChainBreakReason,
}

// ============================================================================
// Chain Verification
// ============================================================================

/// Summary of a verified run of events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainSummary {
    pub event_count: usize,
    pub id_min: Option<i64>,
    pub id_max: Option<i64>,
    /// Block hash of the last verified event
    pub head_hash: Option<String>,
}

/// Verify a chain that starts at genesis.
pub fn verify_chain(events: &[LedgerEvent]) -> Result<ChainSummary, ChainBreak> {
    verify_chain_from(events, None)
}

/// Verify `events` in order, the first of which must link to `expected_prev`.
pub fn verify_chain_from(
    events: &[LedgerEvent],
    expected_prev: Option<&str>,
) -> Result<ChainSummary, ChainBreak> {
    let mut previous: Option<&str> = expected_prev;

    for (index, event) in events.iter().enumerate() {
        let chain_break = |reason| ChainBreak {
            index,
            event_id: event.id,
            reason,
        };

        if event.prev_hash.as_deref() != previous {
            return Err(chain_break(ChainBreakReason::PrevHashMismatch));
        }

        let payload = event
            .payload()
            .map_err(|_| chain_break(ChainBreakReason::InvalidPayload))?;
        let canonical_payload = canonicalize_json(&payload);

        let recomputed = compute_block_hash(&BlockHashParams {
            prev_hash: event.prev_hash.as_deref(),
            event_type: &event.event_type,
            created_at: &event.created_at,
            actor_id: event.actor_id,
            canonical_payload: &canonical_payload,
        });
        if hex::encode(recomputed) != event.block_hash {
            return Err(chain_break(ChainBreakReason::BlockHashMismatch));
        }

        previous = Some(event.block_hash.as_str());
    }

    Ok(ChainSummary {
        event_count: events.len(),
        id_min: events.first().map(|e| e.id),
        id_max: events.last().map(|e| e.id),
        head_hash: events.last().map(|e| e.block_hash.clone()),
    })
}

/// Result of [`Ledger::verify`]
///
/// A clean chain carries `message`; a break carries `error` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub scope: VerifyScope,
    #[serde(rename = "break", skip_serializing_if = "Option::is_none")]
    pub chain_break: Option<ChainBreak>,
}

/// Message reported by a verification that found no break
pub const CHAIN_VERIFIED: &str = "chain verified";

/// Which events a verification covered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyScope {
    pub event_count: usize,
    pub id_min: Option<i64>,
    pub id_max: Option<i64>,
}

// ============================================================================
// Ledger
// ============================================================================

/// Validated, canonicalized input for one append
struct PreparedEvent {
    event_type: String,
    canonical_payload: String,
    subject: Option<Subject>,
}

fn prepare(event_type: &str, payload: &Value) -> Result<PreparedEvent, AppendError> {
    validate_event_type(event_type).map_err(AppendError::Validation)?;
    if !payload.is_object() {
        return Err(AppendError::Validation(
            "payload must be a JSON object".to_string(),
        ));
    }
    if EventPayload::is_known(event_type) {
        EventPayload::decode(event_type, payload).map_err(AppendError::Validation)?;
    }

    Ok(PreparedEvent {
        event_type: event_type.to_string(),
        canonical_payload: canonicalize_json(payload),
        subject: Subject::from_payload(payload),
    })
}

/// The append and verification entry point
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    dead_letters: Option<Arc<DeadLetterQueue>>,
    append_lock: Mutex<()>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            dead_letters: None,
            append_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dead_letters(mut self, queue: Arc<DeadLetterQueue>) -> Self {
        self.dead_letters = Some(queue);
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn dead_letters(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dead_letters.as_ref()
    }

    /// Append an event and return its hex block hash.
    ///
    /// Failures after validation are dead-lettered when a queue is configured.
    pub async fn append(
        &self,
        event_type: &str,
        payload: Value,
        actor_id: Option<i64>,
    ) -> Result<String, AppendError> {
        self.append_inner(event_type, payload, actor_id, true).await
    }

    async fn append_inner(
        &self,
        event_type: &str,
        payload: Value,
        actor_id: Option<i64>,
        capture: bool,
    ) -> Result<String, AppendError> {
        let prepared = prepare(event_type, &payload)?;

        let outcome = self
            .retry
            .run(
                |_| self.try_append(&prepared, actor_id),
                LedgerError::is_transient,
            )
            .await;
        let attempts = outcome.attempts;

        let err = match outcome.into_result() {
            Ok(event) => {
                tracing::debug!(
                    event_id = event.id,
                    event_type = %event.event_type,
                    block_hash = %event.block_hash,
                    "Ledger event appended"
                );
                return Ok(event.block_hash);
            }
            Err(LedgerError::Validation(message)) => return Err(AppendError::Validation(message)),
            Err(err) => err,
        };

        let mut dead_lettered = false;
        if capture {
            if let Some(queue) = &self.dead_letters {
                let entry = DeadLetterEntry::new(
                    event_type,
                    payload,
                    actor_id,
                    err.to_string(),
                    self.clock.now(),
                );
                queue.record(&entry).await;
                dead_lettered = true;
            }
        }

        tracing::error!(
            event_type,
            attempts,
            dead_lettered,
            error = %err,
            "Ledger append failed"
        );

        Err(match err {
            LedgerError::Contention => AppendError::Contention {
                attempts,
                dead_lettered,
            },
            other => AppendError::Storage {
                message: other.to_string(),
                dead_lettered,
            },
        })
    }

    async fn try_append(
        &self,
        prepared: &PreparedEvent,
        actor_id: Option<i64>,
    ) -> Result<LedgerEvent, LedgerError> {
        let _guard = self.append_lock.lock().await;

        let prev_hash = self.store.tail().await?.map(|tail| tail.block_hash);
        let created_at = format_timestamp(self.clock.now());
        let block_hash = hex::encode(compute_block_hash(&BlockHashParams {
            prev_hash: prev_hash.as_deref(),
            event_type: &prepared.event_type,
            created_at: &created_at,
            actor_id,
            canonical_payload: &prepared.canonical_payload,
        }));

        self.store
            .insert(NewLedgerEvent {
                event_type: prepared.event_type.clone(),
                payload_json: prepared.canonical_payload.clone(),
                prev_hash,
                block_hash,
                created_at,
                actor_id,
                subject: prepared.subject.clone(),
            })
            .await
    }

    /// Verify all events, or those with ids in `[from_id, to_id]`.
    pub async fn verify(
        &self,
        from_id: Option<i64>,
        to_id: Option<i64>,
    ) -> Result<VerifyOutcome, LedgerError> {
        let events = self.store.range(from_id, to_id).await?;

        let expected_prev = match (from_id, events.first()) {
            (Some(_), Some(first)) => self
                .store
                .predecessor(first.id)
                .await?
                .map(|prev| prev.block_hash),
            _ => None,
        };

        let scope = VerifyScope {
            event_count: events.len(),
            id_min: events.first().map(|e| e.id),
            id_max: events.last().map(|e| e.id),
        };

        Ok(match verify_chain_from(&events, expected_prev.as_deref()) {
            Ok(_) => VerifyOutcome {
                ok: true,
                message: Some(CHAIN_VERIFIED.to_string()),
                error: None,
                scope,
                chain_break: None,
            },
            Err(chain_break) => {
                tracing::warn!(
                    index = chain_break.index,
                    event_id = chain_break.event_id,
                    reason = %chain_break.reason,
                    "Ledger chain verification failed"
                );
                VerifyOutcome {
                    ok: false,
                    message: None,
                    error: Some(chain_break.to_string()),
                    scope,
                    chain_break: Some(chain_break),
                }
            }
        })
    }
}

#[async_trait]
impl ReplayAppender for Ledger {
    async fn append_for_replay(
        &self,
        event_type: &str,
        payload: Value,
        actor_id: Option<i64>,
    ) -> Result<String, String> {
        self.append_inner(event_type, payload, actor_id, false)
            .await
            .map_err(|e| e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
