//! # Action Scheduler
//!
//! Expands matched policies into execution records.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──► success
//!    │──────► failed
//!    └──────► skipped
//! ```
//!
//! All three outcomes are terminal. A failed record can be retried by an
//! operator, which creates a fresh pending record pointing at the original.
//!
//! ## Durability
//!
//! [`ActionScheduler::schedule`] awaits the [`ExecutionStore`] insert before
//! returning, so an acknowledged evaluation never loses its pending work to
//! an executor crash.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vigil_core::{ActionId, EventId, ExecutionId, PolicyId, SubjectId};

use crate::error::{PolicyError, ValidationError};
use crate::journal::ExecutionStore;
use crate::ledger::{Ledger, LedgerRecord};
use crate::model::{Action, Policy};
use crate::store::PolicyStore;

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Status of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting for its due time or for earlier actions of its queue.
    Pending,
    /// Handler completed.
    Success,
    /// Handler failed, timed out or was unavailable.
    Failed,
    /// Policy or action disabled/deleted before dispatch.
    Skipped,
}

impl ExecutionStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [ExecutionStatus; 4] = [Self::Pending, Self::Success, Self::Failed, Self::Skipped];

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// String value for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown execution status: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// One action's lifecycle for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Record identifier.
    pub id: ExecutionId,
    /// Owning policy.
    pub policy_id: PolicyId,
    /// Action to dispatch.
    pub action_id: ActionId,
    /// Triggering event.
    pub event_id: EventId,
    /// Subject of the event.
    pub subject_id: SubjectId,
    /// Action type at scheduling time.
    pub action_type: String,
    /// Position within the (policy, event) queue.
    pub execution_order: u32,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the record becomes due.
    pub scheduled_at: DateTime<Utc>,
    /// When an executor claimed it.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure or skip reason.
    pub error_detail: Option<String>,
    /// Original record when this is an operator retry.
    pub retry_of: Option<ExecutionId>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// A pending record for `action` of `policy`, due after the action's delay.
    pub fn pending(
        policy: &Policy,
        action: &Action,
        event_id: &EventId,
        subject_id: &SubjectId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            policy_id: policy.id,
            action_id: action.id,
            event_id: event_id.clone(),
            subject_id: subject_id.clone(),
            action_type: action.action.action_type().to_string(),
            execution_order: action.execution_order,
            status: ExecutionStatus::Pending,
            scheduled_at: now + action.delay(),
            started_at: None,
            completed_at: None,
            error_detail: None,
            retry_of: None,
            created_at: now,
        }
    }

    /// Whether the record is pending and its due time has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Pending && self.scheduled_at <= now
    }

    /// Sequential queue the record belongs to.
    pub fn queue_key(&self) -> (PolicyId, &EventId) {
        (self.policy_id, &self.event_id)
    }

    /// Position within its queue; lower runs first.
    pub fn queue_position(&self) -> (u32, DateTime<Utc>, ExecutionId) {
        (self.execution_order, self.scheduled_at, self.id)
    }

    pub(crate) fn ledger_record(&self, from: Option<ExecutionStatus>) -> LedgerRecord {
        LedgerRecord::Execution {
            execution_id: self.id,
            policy_id: self.policy_id,
            action_id: self.action_id,
            event_id: self.event_id.clone(),
            subject_id: self.subject_id.clone(),
            action_type: self.action_type.clone(),
            from,
            to: self.status,
            detail: self.error_detail.clone(),
            retry_of: self.retry_of,
        }
    }
}

// ---------------------------------------------------------------------------
// ActionScheduler
// ---------------------------------------------------------------------------

/// Actor recorded for transitions the engine performs on its own.
pub const ENGINE_ACTOR: &str = "engine";

/// Creates and persists execution records.
#[derive(Clone)]
pub struct ActionScheduler {
    executions: Arc<dyn ExecutionStore>,
    policies: Arc<PolicyStore>,
    ledger: Arc<Ledger>,
}

impl std::fmt::Debug for ActionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionScheduler").finish_non_exhaustive()
    }
}

impl ActionScheduler {
    /// Scheduler persisting to `executions`.
    pub fn new(executions: Arc<dyn ExecutionStore>, policies: Arc<PolicyStore>, ledger: Arc<Ledger>) -> Self {
        Self {
            executions,
            policies,
            ledger,
        }
    }

    /// One pending record per enabled action of each matched policy.
    ///
    /// Pure; used directly for dry runs.
    pub fn plan(
        matched: &[Arc<Policy>],
        event_id: &EventId,
        subject_id: &SubjectId,
        now: DateTime<Utc>,
    ) -> Vec<ExecutionRecord> {
        matched
            .iter()
            .flat_map(|policy| {
                policy
                    .enabled_actions()
                    .map(move |action| ExecutionRecord::pending(policy, action, event_id, subject_id, now))
            })
            .collect()
    }

    /// Plan and durably persist records for `matched` policies.
    pub async fn schedule(
        &self,
        matched: &[Arc<Policy>],
        event_id: &EventId,
        subject_id: &SubjectId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, PolicyError> {
        let records = Self::plan(matched, event_id, subject_id, now);
        if records.is_empty() {
            return Ok(records);
        }
        self.executions.insert_batch(&records).await?;
        self.policies
            .mark_referenced(records.iter().map(|r| r.policy_id));
        for record in &records {
            self.audit(ENGINE_ACTOR, record, None);
            tracing::debug!(
                execution_id = %record.id,
                policy_id = %record.policy_id,
                event_id = %record.event_id,
                action_type = %record.action_type,
                scheduled_at = %record.scheduled_at,
                "execution scheduled"
            );
        }
        Ok(records)
    }

    /// Create a fresh pending record retrying a failed one.
    pub async fn retry(
        &self,
        execution_id: ExecutionId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord, PolicyError> {
        let original = self
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| PolicyError::NotFound {
                entity: "execution",
                id: execution_id.to_string(),
            })?;
        if original.status != ExecutionStatus::Failed {
            return Err(ValidationError::NotRetryable {
                id: execution_id,
                status: original.status.to_string(),
            }
            .into());
        }
        let retry = ExecutionRecord {
            id: ExecutionId::new(),
            status: ExecutionStatus::Pending,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            error_detail: None,
            retry_of: Some(original.id),
            created_at: now,
            ..original
        };
        self.executions
            .insert_batch(std::slice::from_ref(&retry))
            .await?;
        self.audit(actor, &retry, None);
        tracing::info!(
            execution_id = %retry.id,
            retry_of = %execution_id,
            actor,
            "execution retry scheduled"
        );
        Ok(retry)
    }

    /// Append a transition to the ledger. The record itself is already
    /// durable, so a ledger failure is logged rather than surfaced.
    pub(crate) fn audit(&self, actor: &str, record: &ExecutionRecord, from: Option<ExecutionStatus>) {
        if let Err(error) = self.ledger.append(actor, record.ledger_record(from)) {
            tracing::error!(execution_id = %record.id, %error, "failed to append execution transition to ledger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResolutionCache;
    use std::collections::BTreeMap;

    use crate::journal::{ExecutionFilter, MemoryExecutionStore, StoreError};
    use crate::model::PolicyDraft;
    use serde_json::json;

    fn policy_with_actions() -> Policy {
        let draft: PolicyDraft = serde_json::from_value(json!({
            "name": "exfil",
            "scope": {"type": "global"},
            "actions": [
                {"action": {"type": "alert", "config": {"recipients": ["soc"]}}, "execution_order": 1},
                {"action": {"type": "escalate", "config": {"to": "ir"}}, "execution_order": 2, "delay_secs": 600},
                {"action": {"type": "increase-monitoring", "config": {"level": "high"}}, "execution_order": 3, "enabled": false}
            ]
        }))
        .unwrap();
        Policy::from_draft(draft, Utc::now()).unwrap()
    }

    fn scheduler() -> (ActionScheduler, Arc<MemoryExecutionStore>, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::new(0));
        let cache = Arc::new(ResolutionCache::new(chrono::Duration::minutes(5)));
        let policies = Arc::new(PolicyStore::new(cache, Arc::clone(&ledger)));
        let store = Arc::new(MemoryExecutionStore::new());
        let scheduler = ActionScheduler::new(store.clone(), policies, Arc::clone(&ledger));
        (scheduler, store, ledger)
    }

    #[test]
    fn status_terminality() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        for status in [ExecutionStatus::Success, ExecutionStatus::Failed, ExecutionStatus::Skipped] {
            assert!(status.is_terminal());
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn plan_expands_enabled_actions_with_delays() {
        let policy = Arc::new(policy_with_actions());
        let now = Utc::now();
        let event = EventId::generate();
        let subject = SubjectId::new("emp-1").unwrap();
        let records = ActionScheduler::plan(&[policy], &event, &subject, now);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].scheduled_at, now);
        assert_eq!(records[1].scheduled_at - records[0].scheduled_at, chrono::Duration::minutes(10));
        assert!(records.iter().all(|r| r.status == ExecutionStatus::Pending));
        assert_eq!(records[1].action_type, "escalate");
    }

    #[tokio::test]
    async fn schedule_persists_before_returning() {
        let (scheduler, store, ledger) = scheduler();
        let policy = Arc::new(policy_with_actions());
        let records = scheduler
            .schedule(&[policy], &EventId::generate(), &SubjectId::new("emp-1").unwrap(), Utc::now())
            .await
            .unwrap();
        for record in &records {
            assert_eq!(store.get(record.id).await.unwrap().as_ref(), Some(record));
        }
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn retry_requires_failed_original() {
        let (scheduler, store, _) = scheduler();
        let policy = Arc::new(policy_with_actions());
        let now = Utc::now();
        let records = scheduler
            .schedule(&[policy], &EventId::generate(), &SubjectId::new("emp-1").unwrap(), now)
            .await
            .unwrap();
        let first = records[0].id;

        let err = scheduler.retry(first, "alice", now).await.unwrap_err();
        assert!(matches!(err, PolicyError::Validation(ValidationError::NotRetryable { .. })));

        store.claim_due(now, 10).await.unwrap();
        store
            .complete(first, ExecutionStatus::Failed, Some("boom".into()), now)
            .await
            .unwrap();
        let retry = scheduler.retry(first, "alice", now).await.unwrap();
        assert_eq!(retry.retry_of, Some(first));
        assert_eq!(retry.status, ExecutionStatus::Pending);
        assert_ne!(retry.id, first);
        assert_eq!(
            store.get(first).await.unwrap().unwrap().status,
            ExecutionStatus::Failed
        );
    }

    /// Execution store whose backend is unreachable.
    struct UnreachableStore;

    fn unreachable() -> StoreError {
        StoreError::Backend("connection refused".into())
    }

    #[async_trait::async_trait]
    impl ExecutionStore for UnreachableStore {
        async fn insert_batch(&self, _: &[ExecutionRecord]) -> Result<(), StoreError> {
            Err(unreachable())
        }
        async fn get(&self, _: ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
            Err(unreachable())
        }
        async fn claim_due(&self, _: DateTime<Utc>, _: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
            Err(unreachable())
        }
        async fn complete(
            &self,
            _: ExecutionId,
            _: ExecutionStatus,
            _: Option<String>,
            _: DateTime<Utc>,
        ) -> Result<ExecutionRecord, StoreError> {
            Err(unreachable())
        }
        async fn reap_stale(&self, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<Vec<ExecutionRecord>, StoreError> {
            Err(unreachable())
        }
        async fn list(&self, _: &ExecutionFilter) -> Result<Vec<ExecutionRecord>, StoreError> {
            Err(unreachable())
        }
        async fn references_policy(&self, _: PolicyId) -> Result<bool, StoreError> {
            Err(unreachable())
        }
        async fn referenced_policies(&self) -> Result<Vec<PolicyId>, StoreError> {
            Err(unreachable())
        }
        async fn status_counts(&self) -> Result<BTreeMap<ExecutionStatus, u64>, StoreError> {
            Err(unreachable())
        }
    }

    #[tokio::test]
    async fn failed_insert_leaves_scope_editable() {
        let ledger = Arc::new(Ledger::new(0));
        let cache = Arc::new(ResolutionCache::new(chrono::Duration::minutes(5)));
        let policies = Arc::new(PolicyStore::new(cache, Arc::clone(&ledger)));
        let policy = policies
            .create_policy(
                serde_json::from_value(json!({
                    "name": "exfil",
                    "scope": {"type": "global"},
                    "actions": [{"action": {"type": "alert", "config": {"recipients": ["soc"]}}}]
                }))
                .unwrap(),
                "admin",
            )
            .unwrap();
        let entries_before = ledger.len();
        let scheduler = ActionScheduler::new(Arc::new(UnreachableStore), Arc::clone(&policies), Arc::clone(&ledger));

        let err = scheduler
            .schedule(&[Arc::clone(&policy)], &EventId::generate(), &SubjectId::new("emp-1").unwrap(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Store(StoreError::Backend(_))));
        assert!(!policies.is_referenced(policy.id));
        assert_eq!(ledger.len(), entries_before);
    }

    #[tokio::test]
    async fn successful_insert_locks_scope() {
        let ledger = Arc::new(Ledger::new(0));
        let cache = Arc::new(ResolutionCache::new(chrono::Duration::minutes(5)));
        let policies = Arc::new(PolicyStore::new(cache, Arc::clone(&ledger)));
        let policy = policies
            .create_policy(
                serde_json::from_value(json!({
                    "name": "exfil",
                    "scope": {"type": "global"},
                    "actions": [{"action": {"type": "alert", "config": {"recipients": ["soc"]}}}]
                }))
                .unwrap(),
                "admin",
            )
            .unwrap();
        let scheduler = ActionScheduler::new(
            Arc::new(MemoryExecutionStore::new()),
            Arc::clone(&policies),
            Arc::clone(&ledger),
        );

        scheduler
            .schedule(&[Arc::clone(&policy)], &EventId::generate(), &SubjectId::new("emp-1").unwrap(), Utc::now())
            .await
            .unwrap();
        assert!(policies.is_referenced(policy.id));
    }

    #[tokio::test]
    async fn retry_of_unknown_record_is_not_found() {
        let (scheduler, _, _) = scheduler();
        let err = scheduler.retry(ExecutionId::new(), "alice", Utc::now()).await.unwrap_err();
        assert!(matches!(err, PolicyError::NotFound { entity: "execution", .. }));
    }
}
