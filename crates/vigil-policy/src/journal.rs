//! # Execution Store
//!
//! Durable home of [`ExecutionRecord`]s. The scheduler inserts, the executor
//! claims and completes; nothing else writes.
//!
//! ## Claiming
//!
//! Records of one (policy, event) pair form a sequential queue ordered by
//! [`ExecutionRecord::queue_position`]. `claim_due` hands out a record only
//! if it is pending, unclaimed and due, and no other pending record of its
//! queue is already claimed or positioned before it. The queue therefore
//! advances one record at a time no matter how many executors poll.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vigil_core::{EventId, ExecutionId, PolicyId, SubjectId};

use crate::scheduler::{ExecutionRecord, ExecutionStatus};

/// Execution store failure.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record with this id.
    #[error("execution {0} not found")]
    NotFound(ExecutionId),

    /// The record already reached a terminal status.
    #[error("execution {id} is already {status}; terminal statuses are never overwritten")]
    TerminalStatus {
        /// Record id.
        id: ExecutionId,
        /// Its terminal status.
        status: ExecutionStatus,
    },

    /// Only terminal statuses can be written through `complete`.
    #[error("execution {id} cannot transition to {to}")]
    InvalidTransition {
        /// Record id.
        id: ExecutionId,
        /// Requested status.
        to: ExecutionStatus,
    },

    /// A record with this id already exists.
    #[error("execution {0} already exists")]
    Duplicate(ExecutionId),

    /// Backend failure (database, network).
    #[error("execution store backend error: {0}")]
    Backend(String),
}

/// Filter for [`ExecutionStore::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    /// Only records of this policy.
    #[serde(default)]
    pub policy_id: Option<PolicyId>,
    /// Only records of this event.
    #[serde(default)]
    pub event_id: Option<EventId>,
    /// Only records of this subject.
    #[serde(default)]
    pub subject_id: Option<SubjectId>,
    /// Only records in this status.
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    /// Maximum number of records.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    /// Whether `record` passes the filter (ignores `limit`).
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.policy_id.map_or(true, |p| record.policy_id == p)
            && self.event_id.as_ref().map_or(true, |e| record.event_id == *e)
            && self.subject_id.as_ref().map_or(true, |s| record.subject_id == *s)
            && self.status.map_or(true, |s| record.status == s)
    }
}

/// Message stamped on records recovered from a crashed executor.
pub const INTERRUPTED_DETAIL: &str =
    "execution horizon exceeded: claimed but never completed (executor interrupted)";

/// Persistence for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist new pending records. All or nothing.
    async fn insert_batch(&self, records: &[ExecutionRecord]) -> Result<(), StoreError>;

    /// Fetch one record.
    async fn get(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Claim up to `limit` eligible records, stamping `started_at = now`.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Move a pending record to a terminal status.
    async fn complete(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, StoreError>;

    /// Fail pending records claimed before `cutoff`.
    async fn reap_stale(&self, cutoff: DateTime<Utc>, at: DateTime<Utc>) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Records matching `filter`, ordered by due time then execution order.
    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Whether any record references `policy_id`.
    async fn references_policy(&self, policy_id: PolicyId) -> Result<bool, StoreError>;

    /// Every policy id referenced by at least one record.
    async fn referenced_policies(&self) -> Result<Vec<PolicyId>, StoreError>;

    /// Record count per status.
    async fn status_counts(&self) -> Result<BTreeMap<ExecutionStatus, u64>, StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryExecutionStore
// ---------------------------------------------------------------------------

/// In-process execution store.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    records: Mutex<HashMap<ExecutionId, ExecutionRecord>>,
}

impl MemoryExecutionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Ids of records `claim_due` may hand out, in dispatch order.
pub fn eligible_for_claim<'a>(
    records: impl IntoIterator<Item = &'a ExecutionRecord>,
    now: DateTime<Utc>,
) -> Vec<ExecutionId> {
    let mut queues: HashMap<(PolicyId, &EventId), Vec<&ExecutionRecord>> = HashMap::new();
    for record in records {
        if record.status == ExecutionStatus::Pending {
            queues.entry(record.queue_key()).or_default().push(record);
        }
    }
    let mut eligible: Vec<&ExecutionRecord> = queues
        .into_values()
        .filter(|queue| queue.iter().all(|r| r.started_at.is_none()))
        .filter_map(|queue| queue.into_iter().min_by_key(|r| r.queue_position()))
        .filter(|head| head.scheduled_at <= now)
        .collect();
    eligible.sort_by_key(|r| (r.scheduled_at, r.execution_order, r.id));
    eligible.into_iter().map(|r| r.id).collect()
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert_batch(&self, records: &[ExecutionRecord]) -> Result<(), StoreError> {
        let mut map = self.records.lock();
        if let Some(existing) = records.iter().find(|r| map.contains_key(&r.id)) {
            return Err(StoreError::Duplicate(existing.id));
        }
        for record in records {
            map.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut map = self.records.lock();
        let ids = eligible_for_claim(map.values(), now);
        let mut claimed = Vec::new();
        for id in ids.into_iter().take(limit) {
            if let Some(record) = map.get_mut(&id) {
                record.started_at = Some(now);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition { id, to: status });
        }
        let mut map = self.records.lock();
        let record = map.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.status.is_terminal() {
            return Err(StoreError::TerminalStatus {
                id,
                status: record.status,
            });
        }
        record.status = status;
        record.completed_at = Some(at);
        record.started_at.get_or_insert(at);
        record.error_detail = detail;
        Ok(record.clone())
    }

    async fn reap_stale(&self, cutoff: DateTime<Utc>, at: DateTime<Utc>) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut map = self.records.lock();
        let mut reaped = Vec::new();
        for record in map.values_mut() {
            let stale = record.status == ExecutionStatus::Pending
                && record.started_at.is_some_and(|started| started < cutoff);
            if stale {
                record.status = ExecutionStatus::Failed;
                record.completed_at = Some(at);
                record.error_detail = Some(INTERRUPTED_DETAIL.to_string());
                reaped.push(record.clone());
            }
        }
        Ok(reaped)
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>, StoreError> {
        let map = self.records.lock();
        let mut records: Vec<ExecutionRecord> =
            map.values().filter(|r| filter.matches(r)).cloned().collect();
        records.sort_by_key(|r| (r.scheduled_at, r.execution_order, r.id));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn references_policy(&self, policy_id: PolicyId) -> Result<bool, StoreError> {
        Ok(self.records.lock().values().any(|r| r.policy_id == policy_id))
    }

    async fn referenced_policies(&self) -> Result<Vec<PolicyId>, StoreError> {
        let mut ids: Vec<PolicyId> = self.records.lock().values().map(|r| r.policy_id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn status_counts(&self) -> Result<BTreeMap<ExecutionStatus, u64>, StoreError> {
        let mut counts: BTreeMap<ExecutionStatus, u64> =
            ExecutionStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for record in self.records.lock().values() {
            *counts.entry(record.status).or_default() += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::ActionId;

    fn record(policy: PolicyId, event: &EventId, order: u32, scheduled_at: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            id: ExecutionId::new(),
            policy_id: policy,
            action_id: ActionId::new(),
            event_id: event.clone(),
            subject_id: SubjectId::new("emp-1").unwrap(),
            action_type: "alert".into(),
            execution_order: order,
            status: ExecutionStatus::Pending,
            scheduled_at,
            started_at: None,
            completed_at: None,
            error_detail: None,
            retry_of: None,
            created_at: scheduled_at,
        }
    }

    #[tokio::test]
    async fn queue_advances_one_record_at_a_time() {
        let store = MemoryExecutionStore::new();
        let now = Utc::now();
        let policy = PolicyId::new();
        let event = EventId::generate();
        let first = record(policy, &event, 1, now);
        let second = record(policy, &event, 2, now);
        store.insert_batch(&[second.clone(), first.clone()]).await.unwrap();

        let claimed = store.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![first.id]);
        assert!(store.claim_due(now, 10).await.unwrap().is_empty());

        store.complete(first.id, ExecutionStatus::Success, None, now).await.unwrap();
        let claimed = store.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second.id]);
    }

    #[tokio::test]
    async fn later_action_waits_for_delayed_earlier_one() {
        let store = MemoryExecutionStore::new();
        let now = Utc::now();
        let policy = PolicyId::new();
        let event = EventId::generate();
        let delayed_first = record(policy, &event, 1, now + chrono::Duration::minutes(5));
        let immediate_second = record(policy, &event, 2, now);
        store.insert_batch(&[delayed_first, immediate_second]).await.unwrap();
        assert!(store.claim_due(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn independent_queues_claim_together() {
        let store = MemoryExecutionStore::new();
        let now = Utc::now();
        let event = EventId::generate();
        let other_event = EventId::generate();
        let policy = PolicyId::new();
        store
            .insert_batch(&[
                record(policy, &event, 1, now),
                record(PolicyId::new(), &event, 1, now),
                record(policy, &other_event, 1, now),
            ])
            .await
            .unwrap();
        assert_eq!(store.claim_due(now, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn claim_respects_limit_and_due_time() {
        let store = MemoryExecutionStore::new();
        let now = Utc::now();
        let event = EventId::generate();
        store
            .insert_batch(&[
                record(PolicyId::new(), &event, 1, now),
                record(PolicyId::new(), &event, 1, now),
                record(PolicyId::new(), &event, 1, now + chrono::Duration::seconds(30)),
            ])
            .await
            .unwrap();
        assert_eq!(store.claim_due(now, 1).await.unwrap().len(), 1);
        assert_eq!(store.claim_due(now, 10).await.unwrap().len(), 1);
        assert!(store.claim_due(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_status_is_never_overwritten() {
        let store = MemoryExecutionStore::new();
        let now = Utc::now();
        let r = record(PolicyId::new(), &EventId::generate(), 1, now);
        store.insert_batch(std::slice::from_ref(&r)).await.unwrap();
        store
            .complete(r.id, ExecutionStatus::Failed, Some("handler error".into()), now)
            .await
            .unwrap();
        let err = store.complete(r.id, ExecutionStatus::Success, None, now).await.unwrap_err();
        assert!(matches!(err, StoreError::TerminalStatus { status: ExecutionStatus::Failed, .. }));
        let err = store.complete(r.id, ExecutionStatus::Pending, None, now).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn duplicate_insert_is_all_or_nothing() {
        let store = MemoryExecutionStore::new();
        let now = Utc::now();
        let r = record(PolicyId::new(), &EventId::generate(), 1, now);
        store.insert_batch(std::slice::from_ref(&r)).await.unwrap();
        let fresh = record(PolicyId::new(), &EventId::generate(), 1, now);
        assert!(store.insert_batch(&[fresh.clone(), r]).await.is_err());
        assert!(store.get(fresh.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reap_fails_orphaned_claims() {
        let store = MemoryExecutionStore::new();
        let start = Utc::now() - chrono::Duration::minutes(20);
        let r = record(PolicyId::new(), &EventId::generate(), 1, start);
        store.insert_batch(std::slice::from_ref(&r)).await.unwrap();
        store.claim_due(start, 10).await.unwrap();

        let now = Utc::now();
        let reaped = store.reap_stale(now - chrono::Duration::minutes(10), now).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, ExecutionStatus::Failed);
        assert_eq!(reaped[0].error_detail.as_deref(), Some(INTERRUPTED_DETAIL));
    }

    #[tokio::test]
    async fn list_filters_and_counts() {
        let store = MemoryExecutionStore::new();
        let now = Utc::now();
        let policy = PolicyId::new();
        let event = EventId::generate();
        let a = record(policy, &event, 1, now);
        let b = record(PolicyId::new(), &event, 1, now);
        store.insert_batch(&[a.clone(), b]).await.unwrap();
        store.claim_due(now, 10).await.unwrap();
        store.complete(a.id, ExecutionStatus::Skipped, Some("policy disabled".into()), now).await.unwrap();

        let filter = ExecutionFilter {
            policy_id: Some(policy),
            ..ExecutionFilter::default()
        };
        assert_eq!(store.list(&filter).await.unwrap().len(), 1);
        assert!(store.references_policy(policy).await.unwrap());
        assert!(!store.references_policy(PolicyId::new()).await.unwrap());
        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts[&ExecutionStatus::Skipped], 1);
        assert_eq!(counts[&ExecutionStatus::Pending], 1);
        assert_eq!(counts[&ExecutionStatus::Success], 0);
        assert_eq!(store.referenced_policies().await.unwrap().len(), 2);
    }
}
