//! In-memory stores
//!
//! Same semantics as the SQLite stores, including conditional tail insert
//! and the one-live-anchor-per-period rule. Used by tests and embedders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::domain::{
    Anchor, AnchorConfirmation, AnchorFilter, AnchorPeriod, AnchorStatus, AnchorSubmission,
    KeyRecord, LedgerEvent, NewAnchor, NewLedgerEvent, Subject,
};

use super::{transition_refused, AnchorStore, KeyRegistry, LedgerError, LedgerStore, Result};

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone)]
struct StoredEvent {
    event: LedgerEvent,
    subject: Option<Subject>,
}

/// In-memory ledger store
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    events: RwLock<Vec<StoredEvent>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row without any chain checks.
    ///
    /// Stands in for direct database tampering in tests.
    pub async fn insert_raw(&self, event: LedgerEvent) {
        let subject = event.payload().ok().and_then(|p| Subject::from_payload(&p));
        self.events.write().await.push(StoredEvent { event, subject });
    }

    /// Overwrite a stored row in place.
    pub async fn tamper<F: FnOnce(&mut LedgerEvent)>(&self, id: i64, mutate: F) -> bool {
        let mut events = self.events.write().await;
        match events.iter_mut().find(|s| s.event.id == id) {
            Some(stored) => {
                mutate(&mut stored.event);
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn tail(&self) -> Result<Option<LedgerEvent>> {
        Ok(self.events.read().await.last().map(|s| s.event.clone()))
    }

    async fn insert(&self, event: NewLedgerEvent) -> Result<LedgerEvent> {
        let mut events = self.events.write().await;
        let tail_hash = events.last().map(|s| s.event.block_hash.as_str());
        if tail_hash != event.prev_hash.as_deref() {
            return Err(LedgerError::Contention);
        }

        let id = events.last().map(|s| s.event.id + 1).unwrap_or(1);
        let stored = LedgerEvent {
            id,
            event_type: event.event_type,
            payload_json: event.payload_json,
            prev_hash: event.prev_hash,
            block_hash: event.block_hash,
            created_at: event.created_at,
            actor_id: event.actor_id,
        };
        events.push(StoredEvent {
            event: stored.clone(),
            subject: event.subject,
        });
        Ok(stored)
    }

    async fn get(&self, id: i64) -> Result<Option<LedgerEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .find(|s| s.event.id == id)
            .map(|s| s.event.clone()))
    }

    async fn range(&self, from_id: Option<i64>, to_id: Option<i64>) -> Result<Vec<LedgerEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|s| from_id.map_or(true, |from| s.event.id >= from))
            .filter(|s| to_id.map_or(true, |to| s.event.id <= to))
            .map(|s| s.event.clone())
            .collect())
    }

    async fn predecessor(&self, id: i64) -> Result<Option<LedgerEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|s| s.event.id < id)
            .max_by_key(|s| s.event.id)
            .map(|s| s.event.clone()))
    }

    async fn in_period(&self, period: &AnchorPeriod) -> Result<Vec<LedgerEvent>> {
        let (start, end) = period.bounds();
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|s| {
                !s.event.block_hash.is_empty()
                    && s.event.created_at.as_str() >= start.as_str()
                    && s.event.created_at.as_str() < end.as_str()
            })
            .map(|s| s.event.clone())
            .collect())
    }

    async fn for_subject(&self, subject: &Subject) -> Result<Vec<LedgerEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|s| s.subject.as_ref() == Some(subject))
            .map(|s| s.event.clone())
            .collect())
    }
}

// ============================================================================
// Anchors
// ============================================================================

/// In-memory anchor store
#[derive(Debug, Default)]
pub struct MemoryAnchorStore {
    anchors: RwLock<BTreeMap<i64, ClaimedAnchor>>,
}

#[derive(Debug)]
struct ClaimedAnchor {
    anchor: Anchor,
    claimed_until: Option<DateTime<Utc>>,
}

impl MemoryAnchorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `mutate` only if `allowed` holds for the current row
    async fn transition<G, F>(
        &self,
        id: i64,
        transition: &str,
        allowed: G,
        mutate: F,
    ) -> Result<Anchor>
    where
        G: FnOnce(&ClaimedAnchor) -> bool,
        F: FnOnce(&mut ClaimedAnchor),
    {
        let mut anchors = self.anchors.write().await;
        let entry = anchors
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("anchor", id))?;
        if !allowed(entry) {
            return Err(transition_refused(&entry.anchor, transition));
        }
        mutate(entry);
        Ok(entry.anchor.clone())
    }
}

fn settles(entry: &ClaimedAnchor, tx_hash: &str) -> bool {
    entry.anchor.status == AnchorStatus::Pending
        && entry.anchor.tx_hash.as_deref() == Some(tx_hash)
}

#[async_trait]
impl AnchorStore for MemoryAnchorStore {
    async fn create(&self, anchor: NewAnchor) -> Result<Anchor> {
        let mut anchors = self.anchors.write().await;
        let occupied = anchors
            .values()
            .map(|e| &e.anchor)
            .any(|a| a.period() == anchor.period && a.status.occupies_period());
        if occupied {
            let (period_start, period_end) = anchor.period.bounds();
            return Err(LedgerError::DuplicatePeriod {
                period_start,
                period_end,
            });
        }

        let id = anchors.keys().next_back().map(|id| id + 1).unwrap_or(1);
        let created = Anchor {
            id,
            period_start: anchor.period.start,
            period_end: anchor.period.end,
            events_count: anchor.events_count,
            merkle_root: anchor.merkle_root,
            status: anchor.status,
            network: None,
            chain_id: None,
            contract_address: None,
            tx_hash: None,
            block_number: None,
            log_index: None,
            anchored_at: None,
            created_at: anchor.created_at,
            submitted_at: None,
            failure_reason: None,
        };
        anchors.insert(
            id,
            ClaimedAnchor {
                anchor: created.clone(),
                claimed_until: None,
            },
        );
        Ok(created)
    }

    async fn get(&self, id: i64) -> Result<Option<Anchor>> {
        Ok(self.anchors.read().await.get(&id).map(|e| e.anchor.clone()))
    }

    async fn live_for_period(&self, period: &AnchorPeriod) -> Result<Option<Anchor>> {
        Ok(self
            .anchors
            .read()
            .await
            .values()
            .map(|e| &e.anchor)
            .find(|a| a.period() == *period && a.status.occupies_period())
            .cloned())
    }

    async fn for_period(&self, period: &AnchorPeriod) -> Result<Vec<Anchor>> {
        Ok(self
            .anchors
            .read()
            .await
            .values()
            .rev()
            .map(|e| &e.anchor)
            .filter(|a| a.period() == *period)
            .cloned()
            .collect())
    }

    async fn list(&self, filter: &AnchorFilter) -> Result<(Vec<Anchor>, i64)> {
        let anchors = self.anchors.read().await;
        let mut matching: Vec<&Anchor> = anchors
            .values()
            .map(|e| &e.anchor)
            .filter(|a| filter.from.map_or(true, |from| a.period_start >= from))
            .filter(|a| filter.to.map_or(true, |to| a.period_start < to))
            .filter(|a| filter.status.map_or(true, |s| a.status == s))
            .collect();
        matching.sort_by(|a, b| b.period_start.cmp(&a.period_start).then(b.id.cmp(&a.id)));

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn claim_for_publish(
        &self,
        id: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Anchor> {
        self.transition(
            id,
            "claimed for publishing",
            |e| {
                e.anchor.status == AnchorStatus::Pending
                    && e.anchor.tx_hash.is_none()
                    && e.claimed_until.map_or(true, |until| until <= now)
            },
            |e| e.claimed_until = Some(lease_until),
        )
        .await
    }

    async fn release_claim(&self, id: i64) -> Result<()> {
        if let Some(entry) = self.anchors.write().await.get_mut(&id) {
            if entry.anchor.tx_hash.is_none() {
                entry.claimed_until = None;
            }
        }
        Ok(())
    }

    async fn record_submission(&self, id: i64, submission: &AnchorSubmission) -> Result<Anchor> {
        self.transition(
            id,
            "submitted",
            |e| e.anchor.status == AnchorStatus::Pending && e.anchor.tx_hash.is_none(),
            |e| {
                let a = &mut e.anchor;
                a.tx_hash = Some(submission.tx_hash.clone());
                a.network = Some(submission.network.clone());
                a.chain_id = Some(submission.chain_id);
                a.contract_address = Some(submission.contract_address.clone());
                a.submitted_at = Some(submission.submitted_at);
                e.claimed_until = None;
            },
        )
        .await
    }

    async fn mark_confirmed(
        &self,
        id: i64,
        tx_hash: &str,
        confirmation: &AnchorConfirmation,
    ) -> Result<Anchor> {
        self.transition(
            id,
            "confirmed",
            |e| settles(e, tx_hash),
            |e| {
                let a = &mut e.anchor;
                a.status = AnchorStatus::Confirmed;
                a.block_number = Some(confirmation.block_number);
                a.log_index = confirmation.log_index;
                a.anchored_at = Some(confirmation.anchored_at);
            },
        )
        .await
    }

    async fn mark_failed(&self, id: i64, tx_hash: &str, reason: &str) -> Result<Anchor> {
        self.transition(
            id,
            "failed",
            |e| settles(e, tx_hash),
            |e| {
                e.anchor.status = AnchorStatus::Failed;
                e.anchor.failure_reason = Some(reason.to_string());
            },
        )
        .await
    }
}

// ============================================================================
// Keys
// ============================================================================

/// In-memory key registry
#[derive(Debug, Default)]
pub struct MemoryKeyRegistry {
    keys: RwLock<BTreeMap<String, KeyRecord>>,
}

impl MemoryKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyRegistry for MemoryKeyRegistry {
    async fn get(&self, key_id: &str) -> Result<Option<KeyRecord>> {
        Ok(self.keys.read().await.get(key_id).cloned())
    }

    async fn list(&self) -> Result<Vec<KeyRecord>> {
        let mut keys: Vec<KeyRecord> = self.keys.read().await.values().cloned().collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(keys)
    }

    async fn register(&self, record: KeyRecord) -> Result<()> {
        self.keys
            .write()
            .await
            .entry(record.key_id.clone())
            .or_insert(record);
        Ok(())
    }

    async fn activate(&self, key_id: &str) -> Result<()> {
        let mut keys = self.keys.write().await;
        match keys.get(key_id) {
            None => return Err(LedgerError::not_found("key", key_id)),
            Some(record) if record.is_revoked => {
                return Err(LedgerError::Validation(format!(
                    "key {key_id} is revoked and cannot be activated"
                )))
            }
            Some(_) => {}
        }
        for (id, record) in keys.iter_mut() {
            record.is_active = id == key_id;
        }
        Ok(())
    }

    async fn revoke(&self, key_id: &str, reason: &str) -> Result<KeyRecord> {
        let mut keys = self.keys.write().await;
        let record = keys
            .get_mut(key_id)
            .ok_or_else(|| LedgerError::not_found("key", key_id))?;
        record.is_revoked = true;
        record.is_active = false;
        record.revocation_reason = Some(reason.to_string());
        record.revoked_at = Some(Utc::now());
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn new_event(prev: Option<&str>, hash: &str) -> NewLedgerEvent {
        NewLedgerEvent {
            event_type: "test".into(),
            payload_json: "{}".into(),
            prev_hash: prev.map(str::to_string),
            block_hash: hash.into(),
            created_at: "2026-01-05T10:00:00.000000Z".into(),
            actor_id: None,
            subject: None,
        }
    }

    fn period() -> AnchorPeriod {
        AnchorPeriod::for_day(NaiveDate::from_ymd_opt(2026, 1, 5).unwrap())
    }

    fn submission(tx_hash: &str) -> AnchorSubmission {
        AnchorSubmission {
            tx_hash: tx_hash.into(),
            network: "sepolia".into(),
            chain_id: 11155111,
            contract_address: "0x0000000000000000000000000000000000000001".into(),
            submitted_at: Utc::now(),
        }
    }

    fn new_anchor(status: AnchorStatus) -> NewAnchor {
        NewAnchor {
            period: period(),
            events_count: 1,
            merkle_root: Some("aa".into()),
            status,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_requires_current_tail() {
        let store = MemoryLedgerStore::new();
        let first = store.insert(new_event(None, "h1")).await.unwrap();
        assert_eq!(first.id, 1);

        let stale = store.insert(new_event(None, "h2")).await;
        assert!(matches!(stale, Err(LedgerError::Contention)));

        let second = store.insert(new_event(Some("h1"), "h2")).await.unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(store.predecessor(2).await.unwrap().unwrap().id, 1);
        assert!(store.predecessor(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_live_anchor_per_period() {
        let store = MemoryAnchorStore::new();
        let first = store.create(new_anchor(AnchorStatus::Pending)).await.unwrap();

        let dup = store.create(new_anchor(AnchorStatus::Pending)).await;
        assert!(matches!(dup, Err(LedgerError::DuplicatePeriod { .. })));

        store.record_submission(first.id, &submission("t1")).await.unwrap();
        store.mark_failed(first.id, "t1", "transaction reverted").await.unwrap();
        let retry = store.create(new_anchor(AnchorStatus::Pending)).await.unwrap();
        assert_eq!(retry.id, 2);

        let all = store.for_period(&period()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, 2);
        assert_eq!(
            store.live_for_period(&period()).await.unwrap().unwrap().id,
            2
        );
    }

    #[tokio::test]
    async fn test_settled_anchor_refuses_further_transitions() {
        let store = MemoryAnchorStore::new();
        let anchor = store.create(new_anchor(AnchorStatus::Pending)).await.unwrap();
        let confirmation = AnchorConfirmation {
            block_number: 9,
            log_index: None,
            anchored_at: Utc::now(),
        };

        // Nothing to settle before a transaction is recorded
        let early = store.mark_confirmed(anchor.id, "t1", &confirmation).await;
        assert!(matches!(early, Err(LedgerError::InvalidState(_))));

        store.record_submission(anchor.id, &submission("t1")).await.unwrap();
        let again = store.record_submission(anchor.id, &submission("t2")).await;
        assert!(matches!(again, Err(LedgerError::InvalidState(_))));

        let wrong_tx = store.mark_failed(anchor.id, "t2", "transaction dropped").await;
        assert!(matches!(wrong_tx, Err(LedgerError::InvalidState(_))));

        store.mark_confirmed(anchor.id, "t1", &confirmation).await.unwrap();
        let late = store.mark_failed(anchor.id, "t1", "transaction dropped").await;
        assert!(matches!(late, Err(LedgerError::InvalidState(_))));

        let stored = store.get(anchor.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AnchorStatus::Confirmed);
        assert_eq!(stored.tx_hash.as_deref(), Some("t1"));
        assert!(stored.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_publish_claim_is_exclusive_until_lease_expires() {
        let store = MemoryAnchorStore::new();
        let anchor = store.create(new_anchor(AnchorStatus::Pending)).await.unwrap();
        let now = Utc::now();
        let lease = now + chrono::Duration::minutes(10);

        store.claim_for_publish(anchor.id, now, lease).await.unwrap();
        let rival = store.claim_for_publish(anchor.id, now, lease).await;
        assert!(matches!(rival, Err(LedgerError::InvalidState(_))));

        // An abandoned claim can be taken over once it lapses
        store.claim_for_publish(anchor.id, lease, lease).await.unwrap();

        store.release_claim(anchor.id).await.unwrap();
        store.claim_for_publish(anchor.id, now, lease).await.unwrap();

        store.record_submission(anchor.id, &submission("t1")).await.unwrap();
        let after = store.claim_for_publish(anchor.id, lease, lease).await;
        assert!(matches!(after, Err(LedgerError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_key_activation_is_exclusive() {
        let registry = MemoryKeyRegistry::new();
        registry.register(KeyRecord::new("k1", "pem1", Utc::now())).await.unwrap();
        registry.register(KeyRecord::new("k2", "pem2", Utc::now())).await.unwrap();

        registry.activate("k1").await.unwrap();
        registry.activate("k2").await.unwrap();
        assert!(!registry.get("k1").await.unwrap().unwrap().is_active);
        assert!(registry.get("k2").await.unwrap().unwrap().is_active);

        let revoked = registry.revoke("k2", "compromised").await.unwrap();
        assert!(revoked.is_revoked);
        assert!(registry.activate("k2").await.is_err());
        assert!(registry.activate("missing").await.is_err());
    }
}
