//! Verification aggregator
//!
//! One call answers "is this deployment trustworthy right now": the external
//! authorization registry self-check, then a full ledger chain verification if
//! the caller may read the ledger. Results and timings are recorded in the
//! metrics registry.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::infra::{ChainBreak, Ledger, LedgerError, VerifyScope};
use crate::metrics::{metric_names, MetricsRegistry};

// ============================================================================
// Callers and Capabilities
// ============================================================================

/// Who is asking, as identified by the `x-actor-id` header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Caller {
    pub actor_id: Option<i64>,
}

impl Caller {
    pub fn new(actor_id: Option<i64>) -> Self {
        Self { actor_id }
    }

    fn rate_key(&self) -> String {
        match self.actor_id {
            Some(id) => format!("actor:{id}"),
            None => "anonymous".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    LedgerRead,
    LedgerWrite,
    AnchorPublish,
    EvidenceExport,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::LedgerRead => "ledger_read",
            Capability::LedgerWrite => "ledger_write",
            Capability::AnchorPublish => "anchor_publish",
            Capability::EvidenceExport => "evidence_export",
        }
    }
}

/// Capability predicate supplied by the host application
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, caller: &Caller, capability: Capability) -> bool;
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _caller: &Caller, _capability: Capability) -> bool {
        true
    }
}

/// Per-actor capability table; unknown actors get `default`.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    grants: HashMap<i64, HashSet<Capability>>,
    default: HashSet<Capability>,
}

impl CapabilityTable {
    pub fn new(default: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            grants: HashMap::new(),
            default: default.into_iter().collect(),
        }
    }

    pub fn grant(
        mut self,
        actor_id: i64,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        self.grants.entry(actor_id).or_default().extend(capabilities);
        self
    }
}

impl AccessPolicy for CapabilityTable {
    fn allows(&self, caller: &Caller, capability: Capability) -> bool {
        caller
            .actor_id
            .and_then(|id| self.grants.get(&id))
            .unwrap_or(&self.default)
            .contains(&capability)
    }
}

/// Authorization registry owned by the host application
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthzRegistry: Send + Sync {
    /// Consistency check of roles and permissions; `Err` carries the reason.
    async fn self_check(&self) -> Result<(), String>;
}

/// Registry that always passes its self-check
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuthzRegistry;

#[async_trait]
impl AuthzRegistry for NoopAuthzRegistry {
    async fn self_check(&self) -> Result<(), String> {
        Ok(())
    }
}

// ============================================================================
// Rate Limiting
// ============================================================================

/// Fixed one-minute window per caller
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: u32,
    windows: Mutex<HashMap<String, (u32, Instant)>>,
}

const WINDOW: Duration = Duration::from_secs(60);

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request; `Err` holds the seconds until the window resets.
    ///
    /// Expired windows of every caller are dropped first, so the map only
    /// holds callers seen within the last minute.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        windows.retain(|_, (_, started)| now.duration_since(*started) < WINDOW);
        let entry = windows.entry(key.to_string()).or_insert((0, now));

        if entry.0 >= self.requests_per_minute {
            let retry_after = WINDOW.saturating_sub(now.duration_since(entry.1));
            return Err(retry_after.as_secs().max(1));
        }

        entry.0 += 1;
        Ok(())
    }
}

// ============================================================================
// Aggregator
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Store(#[from] LedgerError),
}

/// Outcome of the ledger part of a verification run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LedgerCheck {
    Passed {
        message: String,
        scope: VerifyScope,
    },
    Failed {
        error: String,
        #[serde(rename = "break")]
        chain_break: Option<ChainBreak>,
        scope: VerifyScope,
    },
    /// Not run; does not fail the report
    Skipped {
        reason: String,
    },
}

impl LedgerCheck {
    pub fn passed(&self) -> bool {
        !matches!(self, LedgerCheck::Failed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationTimings {
    pub total_ms: f64,
    pub authz_ms: f64,
    pub ledger_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub ok: bool,
    pub authz_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authz_error: Option<String>,
    pub ledger: LedgerCheck,
    pub timings: VerificationTimings,
}

pub struct VerificationAggregator {
    ledger: Arc<Ledger>,
    authz: Arc<dyn AuthzRegistry>,
    policy: Arc<dyn AccessPolicy>,
    limiter: RateLimiter,
    metrics: Arc<MetricsRegistry>,
}

impl VerificationAggregator {
    pub fn new(
        ledger: Arc<Ledger>,
        authz: Arc<dyn AuthzRegistry>,
        policy: Arc<dyn AccessPolicy>,
        requests_per_minute: u32,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            ledger,
            authz,
            policy,
            limiter: RateLimiter::new(requests_per_minute),
            metrics,
        }
    }

    pub async fn run(&self, caller: &Caller) -> Result<VerificationReport, VerificationError> {
        if let Err(retry_after_secs) = self.limiter.check(&caller.rate_key()) {
            self.metrics
                .inc_counter(metric_names::VERIFICATION_RATE_LIMITED)
                .await;
            tracing::warn!(actor_id = ?caller.actor_id, "Verification rate limited");
            return Err(VerificationError::RateLimited { retry_after_secs });
        }

        let started = Instant::now();

        let authz_started = Instant::now();
        let authz_result = self.authz.self_check().await;
        let authz_elapsed = authz_started.elapsed();
        self.metrics
            .observe_histogram(
                metric_names::VERIFICATION_AUTHZ_LATENCY,
                authz_elapsed.as_secs_f64(),
            )
            .await;

        let ledger_started = Instant::now();
        let ledger = if self.policy.allows(caller, Capability::LedgerRead) {
            let outcome = self.ledger.verify(None, None).await;
            let ledger_elapsed = ledger_started.elapsed();
            self.metrics
                .observe_histogram(
                    metric_names::VERIFICATION_LEDGER_LATENCY,
                    ledger_elapsed.as_secs_f64(),
                )
                .await;
            match outcome {
                Ok(outcome) if outcome.ok => LedgerCheck::Passed {
                    message: outcome.message.unwrap_or_default(),
                    scope: outcome.scope,
                },
                Ok(outcome) => LedgerCheck::Failed {
                    error: outcome.error.unwrap_or_else(|| "chain break".to_string()),
                    chain_break: outcome.chain_break,
                    scope: outcome.scope,
                },
                Err(e) => {
                    self.record_request(false, started).await;
                    return Err(e.into());
                }
            }
        } else {
            let reason = format!("missing_{}", Capability::LedgerRead.as_str());
            self.metrics
                .inc_counter(&format!(
                    "{}{reason}",
                    metric_names::VERIFICATION_SKIPPED_PREFIX
                ))
                .await;
            LedgerCheck::Skipped { reason }
        };
        let ledger_ms = match ledger {
            LedgerCheck::Skipped { .. } => 0.0,
            _ => millis(ledger_started.elapsed()),
        };

        let authz_ok = authz_result.is_ok();
        let ok = authz_ok && ledger.passed();
        self.record_request(ok, started).await;

        if !ok {
            tracing::warn!(
                authz_ok,
                ledger_ok = ledger.passed(),
                "Verification run failed"
            );
        }

        Ok(VerificationReport {
            ok,
            authz_ok,
            authz_error: authz_result.err(),
            ledger,
            timings: VerificationTimings {
                total_ms: millis(started.elapsed()),
                authz_ms: millis(authz_elapsed),
                ledger_ms,
            },
        })
    }

    async fn record_request(&self, ok: bool, started: Instant) {
        let counter = if ok {
            metric_names::VERIFICATION_OK
        } else {
            metric_names::VERIFICATION_FAIL
        };
        self.metrics.inc_counter(counter).await;
        self.metrics
            .observe_histogram(
                metric_names::VERIFICATION_LATENCY,
                started.elapsed().as_secs_f64(),
            )
            .await;
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
