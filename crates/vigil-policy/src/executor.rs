//! # Executor
//!
//! Background worker pool that runs due execution records.
//!
//! Each poll:
//!
//! 1. fails records orphaned by a crashed executor (claimed longer than
//!    twice the execution horizon ago);
//! 2. claims as many due records as there are free worker permits;
//! 3. runs each claimed record on its own task.
//!
//! At dispatch the executor re-reads the policy and action. A policy that
//! has been disabled or deleted, or an action that has been disabled or
//! deleted, turns the record `skipped` instead of dispatching it. Otherwise
//! the handler runs under `tokio::time::timeout(execution_horizon)`.
//!
//! Ordering within a (policy, event) queue is enforced by the store's claim
//! rule, so a queue never has two records in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::EngineConfig;
use crate::error::ExecutionError;
use crate::handlers::{ActionDispatch, HandlerRegistry};
use crate::journal::{ExecutionStore, StoreError};
use crate::ledger::Ledger;
use crate::model::Action;
use crate::scheduler::{ExecutionRecord, ExecutionStatus, ENGINE_ACTOR};
use crate::store::{DispatchTarget, PolicyStore};

/// What one poll did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Orphaned records failed.
    pub reaped: usize,
    /// Records claimed and started.
    pub dispatched: usize,
}

/// Runs due execution records through action handlers.
pub struct Executor {
    executions: Arc<dyn ExecutionStore>,
    policies: Arc<PolicyStore>,
    ledger: Arc<Ledger>,
    handlers: HandlerRegistry,
    permits: Arc<Semaphore>,
    horizon: Duration,
    poll_interval: Duration,
    batch_size: usize,
    stale_after: chrono::Duration,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("handlers", &self.handlers)
            .field("horizon", &self.horizon)
            .field("poll_interval", &self.poll_interval)
            .field("free_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Executor over the given stores.
    pub fn new(
        config: &EngineConfig,
        executions: Arc<dyn ExecutionStore>,
        policies: Arc<PolicyStore>,
        ledger: Arc<Ledger>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            executions,
            policies,
            ledger,
            handlers,
            permits: Arc::new(Semaphore::new(config.max_concurrent_queues)),
            horizon: config.execution_horizon(),
            poll_interval: config.poll_interval(),
            batch_size: config.claim_batch_size,
            stale_after: config.stale_claim_after(),
        }
    }

    /// Reap, claim and start due records, adding their tasks to `tasks`.
    pub async fn dispatch_due(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        tasks: &mut JoinSet<ExecutionRecord>,
    ) -> Result<TickSummary, StoreError> {
        let reaped = self.executions.reap_stale(now - self.stale_after, now).await?;
        for record in &reaped {
            tracing::warn!(
                execution_id = %record.id,
                policy_id = %record.policy_id,
                "orphaned execution failed"
            );
            self.audit(record);
        }

        let free = self.permits.available_permits().min(self.batch_size);
        if free == 0 {
            return Ok(TickSummary {
                reaped: reaped.len(),
                dispatched: 0,
            });
        }
        let claimed = self.executions.claim_due(now, free).await?;
        let dispatched = claimed.len();
        for record in claimed {
            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => match Arc::clone(&self.permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                this.execute(record).await
            });
        }
        Ok(TickSummary {
            reaped: reaped.len(),
            dispatched,
        })
    }

    /// One poll that waits for every started record to finish.
    pub async fn run_due(self: &Arc<Self>, now: DateTime<Utc>) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut tasks = JoinSet::new();
        self.dispatch_due(now, &mut tasks).await?;
        let mut finished = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(record) => finished.push(record),
                Err(error) => tracing::error!(%error, "execution task panicked"),
            }
        }
        Ok(finished)
    }

    /// Poll forever until `shutdown` flips, then drain in-flight work.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut tasks: JoinSet<ExecutionRecord> = JoinSet::new();
            tracing::info!(
                poll_interval_ms = self.poll_interval.as_millis() as u64,
                horizon_secs = self.horizon.as_secs(),
                "executor started"
            );
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(error) = joined {
                            tracing::error!(%error, "execution task panicked");
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(error) = self.dispatch_due(Utc::now(), &mut tasks).await {
                            tracing::warn!(%error, "executor poll failed");
                        }
                    }
                }
            }
            while tasks.join_next().await.is_some() {}
            tracing::info!("executor stopped");
        })
    }

    /// Run one claimed record to a terminal status.
    pub async fn execute(&self, record: ExecutionRecord) -> ExecutionRecord {
        let (status, detail) = match self.policies.dispatch_target(record.policy_id, record.action_id) {
            DispatchTarget::Ready { action, .. } => self.dispatch(&record, &action).await,
            other => (
                ExecutionStatus::Skipped,
                other.skip_reason().map(str::to_string),
            ),
        };

        match self
            .executions
            .complete(record.id, status, detail, Utc::now())
            .await
        {
            Ok(done) => {
                match done.status {
                    ExecutionStatus::Failed => tracing::warn!(
                        execution_id = %done.id,
                        policy_id = %done.policy_id,
                        event_id = %done.event_id,
                        status = %done.status,
                        detail = done.error_detail.as_deref().unwrap_or_default(),
                        "execution failed"
                    ),
                    _ => tracing::info!(
                        execution_id = %done.id,
                        policy_id = %done.policy_id,
                        event_id = %done.event_id,
                        status = %done.status,
                        detail = done.error_detail.as_deref().unwrap_or_default(),
                        "execution finished"
                    ),
                }
                self.audit(&done);
                done
            }
            Err(error) => {
                tracing::error!(execution_id = %record.id, %error, "could not record execution outcome");
                record
            }
        }
    }

    async fn dispatch(&self, record: &ExecutionRecord, action: &Action) -> (ExecutionStatus, Option<String>) {
        let action_type = action.action.action_type();
        let Some(handler) = self.handlers.resolve(action_type) else {
            let error = ExecutionError::NoHandler(action_type.to_string());
            return (ExecutionStatus::Failed, Some(error.to_string()));
        };
        let dispatch = ActionDispatch {
            execution_id: record.id,
            policy_id: record.policy_id,
            action_id: record.action_id,
            action_type: action_type.to_string(),
            config: action.action.config(),
            subject_id: record.subject_id.clone(),
            event_id: record.event_id.clone(),
        };
        match tokio::time::timeout(self.horizon, handler.handle(&dispatch)).await {
            Ok(Ok(receipt)) => {
                tracing::debug!(
                    execution_id = %record.id,
                    handler = handler.name(),
                    reference = receipt.reference.as_deref().unwrap_or_default(),
                    "handler completed"
                );
                (ExecutionStatus::Success, None)
            }
            Ok(Err(source)) => {
                let error = ExecutionError::Handler {
                    handler: handler.name().to_string(),
                    source,
                };
                (ExecutionStatus::Failed, Some(error.to_string()))
            }
            Err(_) => (
                ExecutionStatus::Failed,
                Some(ExecutionError::HorizonExceeded(self.horizon).to_string()),
            ),
        }
    }

    fn audit(&self, record: &ExecutionRecord) {
        if let Err(error) = self
            .ledger
            .append(ENGINE_ACTOR, record.ledger_record(Some(ExecutionStatus::Pending)))
        {
            tracing::error!(execution_id = %record.id, %error, "failed to append execution transition to ledger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResolutionCache;
    use crate::handlers::{ActionHandler, HandlerError, HandlerReceipt, TracingHandler};
    use crate::journal::MemoryExecutionStore;
    use crate::model::{ActionPatch, PolicyDraft, PolicyPatch};
    use crate::scheduler::ActionScheduler;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use vigil_core::{EventId, SubjectId};

    struct Recording(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl ActionHandler for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle(&self, dispatch: &ActionDispatch) -> Result<HandlerReceipt, HandlerError> {
            self.0.lock().push(dispatch.action_type.clone());
            Ok(HandlerReceipt::default())
        }
    }

    struct Failing;

    #[async_trait]
    impl ActionHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _: &ActionDispatch) -> Result<HandlerReceipt, HandlerError> {
            Err(HandlerError::Unavailable("connection refused".into()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl ActionHandler for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn handle(&self, _: &ActionDispatch) -> Result<HandlerReceipt, HandlerError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(HandlerReceipt::default())
        }
    }

    struct Harness {
        policies: Arc<PolicyStore>,
        executions: Arc<MemoryExecutionStore>,
        scheduler: ActionScheduler,
        ledger: Arc<Ledger>,
    }

    impl Harness {
        fn new() -> Self {
            let ledger = Arc::new(Ledger::new(0));
            let cache = Arc::new(ResolutionCache::new(chrono::Duration::minutes(5)));
            let policies = Arc::new(PolicyStore::new(cache, Arc::clone(&ledger)));
            let executions = Arc::new(MemoryExecutionStore::new());
            let scheduler = ActionScheduler::new(executions.clone(), Arc::clone(&policies), Arc::clone(&ledger));
            Self {
                policies,
                executions,
                scheduler,
                ledger,
            }
        }

        fn executor(&self, config: &EngineConfig, handlers: HandlerRegistry) -> Arc<Executor> {
            Arc::new(Executor::new(
                config,
                self.executions.clone(),
                Arc::clone(&self.policies),
                Arc::clone(&self.ledger),
                handlers,
            ))
        }

        async fn schedule(&self, actions: serde_json::Value, now: DateTime<Utc>) -> Vec<ExecutionRecord> {
            let draft: PolicyDraft = serde_json::from_value(json!({
                "name": "p",
                "scope": {"type": "global"},
                "actions": actions
            }))
            .unwrap();
            let policy = self.policies.create_policy(draft, "admin").unwrap();
            self.scheduler
                .schedule(&[policy], &EventId::generate(), &SubjectId::new("emp-1").unwrap(), now)
                .await
                .unwrap()
        }
    }

    fn alert(order: u32) -> serde_json::Value {
        json!({"action": {"type": "alert", "config": {"recipients": ["soc"]}}, "execution_order": order})
    }

    #[tokio::test]
    async fn runs_queue_in_execution_order() {
        let harness = Harness::new();
        let now = Utc::now();
        harness
            .schedule(
                json!([
                    {"action": {"type": "escalate", "config": {"to": "ir"}}, "execution_order": 2},
                    alert(1),
                    {"action": {"type": "increase-monitoring", "config": {"level": "high"}}, "execution_order": 3}
                ]),
                now,
            )
            .await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let executor = harness.executor(
            &EngineConfig::default(),
            HandlerRegistry::with_fallback(Arc::new(Recording(Arc::clone(&seen)))),
        );
        for _ in 0..3 {
            assert_eq!(executor.run_due(now).await.unwrap().len(), 1);
        }
        assert!(executor.run_due(now).await.unwrap().is_empty());
        assert_eq!(*seen.lock(), vec!["alert", "escalate", "increase-monitoring"]);
    }

    #[tokio::test]
    async fn handler_error_fails_record_without_blocking_siblings() {
        let harness = Harness::new();
        let now = Utc::now();
        harness.schedule(json!([alert(1), {"action": {"type": "escalate", "config": {"to": "ir"}}, "execution_order": 2}]), now).await;
        let mut handlers = HandlerRegistry::with_fallback(Arc::new(TracingHandler));
        handlers.register("alert", Arc::new(Failing));
        let executor = harness.executor(&EngineConfig::default(), handlers);

        let first = executor.run_due(now).await.unwrap();
        assert_eq!(first[0].status, ExecutionStatus::Failed);
        assert!(first[0].error_detail.as_deref().unwrap().contains("connection refused"));
        let second = executor.run_due(now).await.unwrap();
        assert_eq!(second[0].status, ExecutionStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn horizon_exceeded_fails_record() {
        let harness = Harness::new();
        let now = Utc::now();
        harness.schedule(json!([alert(1)]), now).await;
        let config = EngineConfig {
            execution_horizon_secs: 5,
            ..EngineConfig::default()
        };
        let executor = harness.executor(&config, HandlerRegistry::with_fallback(Arc::new(Hanging)));
        let done = executor.run_due(now).await.unwrap();
        assert_eq!(done[0].status, ExecutionStatus::Failed);
        assert_eq!(done[0].error_detail.as_deref(), Some("execution horizon of 5s exceeded"));
    }

    #[tokio::test]
    async fn missing_handler_fails_record() {
        let harness = Harness::new();
        let now = Utc::now();
        harness.schedule(json!([alert(1)]), now).await;
        let executor = harness.executor(&EngineConfig::default(), HandlerRegistry::new());
        let done = executor.run_due(now).await.unwrap();
        assert_eq!(done[0].status, ExecutionStatus::Failed);
        assert!(done[0].error_detail.as_deref().unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn disabled_action_is_skipped_at_dispatch() {
        let harness = Harness::new();
        let now = Utc::now();
        let records = harness.schedule(json!([alert(1)]), now).await;
        harness
            .policies
            .update_action(
                records[0].policy_id,
                records[0].action_id,
                ActionPatch {
                    enabled: Some(false),
                    ..ActionPatch::default()
                },
                "admin",
            )
            .unwrap();
        let executor = harness.executor(&EngineConfig::default(), HandlerRegistry::with_fallback(Arc::new(TracingHandler)));
        let done = executor.run_due(now).await.unwrap();
        assert_eq!(done[0].status, ExecutionStatus::Skipped);
        assert_eq!(done[0].error_detail.as_deref(), Some("action disabled before dispatch"));
    }

    #[tokio::test]
    async fn deactivated_policy_is_skipped_at_dispatch() {
        let harness = Harness::new();
        let now = Utc::now();
        let records = harness.schedule(json!([alert(1)]), now).await;
        harness
            .policies
            .update_policy(
                records[0].policy_id,
                PolicyPatch {
                    active: Some(false),
                    ..PolicyPatch::default()
                },
                "admin",
            )
            .unwrap();
        let executor = harness.executor(&EngineConfig::default(), HandlerRegistry::with_fallback(Arc::new(TracingHandler)));
        let done = executor.run_due(now).await.unwrap();
        assert_eq!(done[0].status, ExecutionStatus::Skipped);
    }

    #[tokio::test]
    async fn delayed_records_wait_for_due_time() {
        let harness = Harness::new();
        let now = Utc::now();
        harness
            .schedule(json!([{"action": {"type": "alert", "config": {"recipients": ["soc"]}}, "delay_secs": 600}]), now)
            .await;
        let executor = harness.executor(&EngineConfig::default(), HandlerRegistry::with_fallback(Arc::new(TracingHandler)));
        assert!(executor.run_due(now).await.unwrap().is_empty());
        let later = now + chrono::Duration::minutes(10);
        assert_eq!(executor.run_due(later).await.unwrap()[0].status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn transitions_are_audited() {
        let harness = Harness::new();
        let now = Utc::now();
        let records = harness.schedule(json!([alert(1)]), now).await;
        let executor = harness.executor(&EngineConfig::default(), HandlerRegistry::with_fallback(Arc::new(TracingHandler)));
        executor.run_due(now).await.unwrap();
        let trail = harness.ledger.for_entity(&records[0].id.to_string());
        let operations: Vec<_> = trail.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(operations, vec!["scheduled", "succeeded"]);
        assert!(trail.iter().all(|e| e.actor == ENGINE_ACTOR));
    }

    #[tokio::test]
    async fn orphaned_claims_are_reaped() {
        let harness = Harness::new();
        let start = Utc::now() - chrono::Duration::hours(1);
        let records = harness.schedule(json!([alert(1)]), start).await;
        harness.executions.claim_due(start, 10).await.unwrap();

        let executor = harness.executor(&EngineConfig::default(), HandlerRegistry::with_fallback(Arc::new(TracingHandler)));
        let mut tasks = JoinSet::new();
        let summary = executor.dispatch_due(Utc::now(), &mut tasks).await.unwrap();
        assert_eq!(summary, TickSummary { reaped: 1, dispatched: 0 });
        let record = harness.executions.get(records[0].id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn background_loop_drains_and_stops() {
        let harness = Harness::new();
        let records = harness.schedule(json!([alert(1), alert(2)]), Utc::now()).await;
        let config = EngineConfig {
            poll_interval_ms: 10,
            ..EngineConfig::default()
        };
        let executor = harness.executor(&config, HandlerRegistry::with_fallback(Arc::new(TracingHandler)));
        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&executor).spawn(rx);

        for _ in 0..200 {
            let done = harness
                .executions
                .list(&Default::default())
                .await
                .unwrap()
                .iter()
                .all(|r| r.status.is_terminal());
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();
        for record in records {
            let stored = harness.executions.get(record.id).await.unwrap().unwrap();
            assert_eq!(stored.status, ExecutionStatus::Success);
        }
    }
}
