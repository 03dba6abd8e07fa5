//! # Policy Engine
//!
//! Wires the store, cache, resolver, evaluator, scheduler and ledger into
//! the `evaluate(subject, event)` entry point used by the API and the CLI.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use vigil_core::{EventId, ExecutionId, PolicyId, SubjectId};

use crate::cache::{CacheInvalidator, ResolutionCache};
use crate::config::EngineConfig;
use crate::directory::DirectoryLookup;
use crate::error::{PolicyError, ValidationError};
use crate::evaluation::{ConditionEvaluator, SecurityEvent};
use crate::executor::Executor;
use crate::handlers::HandlerRegistry;
use crate::journal::{ExecutionStore, MemoryExecutionStore};
use crate::ledger::Ledger;
use crate::resolver::{Resolution, ResolutionSource, Resolver};
use crate::scheduler::{ActionScheduler, ExecutionRecord};
use crate::store::PolicyStore;

/// Result of evaluating one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationOutcome {
    /// Event evaluated.
    pub event_id: EventId,
    /// Subject the event was evaluated for.
    pub subject_id: SubjectId,
    /// Matched policies in resolution order.
    pub matched_policy_ids: Vec<PolicyId>,
    /// Execution records created, in policy then action order.
    pub created_execution_record_ids: Vec<ExecutionId>,
    /// Where the resolution came from.
    pub resolution_source: ResolutionSource,
}

/// What an evaluation would do, without persisting anything.
#[derive(Debug, Clone)]
pub struct Preview {
    /// Resolution used.
    pub resolution: Resolution,
    /// Matched policies in resolution order.
    pub matched_policy_ids: Vec<PolicyId>,
    /// Records that would be scheduled.
    pub planned: Vec<ExecutionRecord>,
}

/// The policy resolution and execution engine.
pub struct PolicyEngine {
    config: EngineConfig,
    store: Arc<PolicyStore>,
    cache: Arc<ResolutionCache>,
    ledger: Arc<Ledger>,
    executions: Arc<dyn ExecutionStore>,
    resolver: Resolver,
    evaluator: ConditionEvaluator,
    scheduler: ActionScheduler,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("config", &self.config)
            .field("policies", &self.store.len())
            .field("ledger_entries", &self.ledger.len())
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// Engine over a durable execution store.
    pub fn new(
        config: EngineConfig,
        directory: Arc<dyn DirectoryLookup>,
        executions: Arc<dyn ExecutionStore>,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let cache = Arc::new(ResolutionCache::new(config.cache_ttl()));
        let ledger = Arc::new(Ledger::new(config.ledger_capacity));
        let store = Arc::new(PolicyStore::new(Arc::clone(&cache), Arc::clone(&ledger)));
        let resolver = Resolver::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            directory,
            config.directory_timeout(),
        );
        let scheduler = ActionScheduler::new(Arc::clone(&executions), Arc::clone(&store), Arc::clone(&ledger));
        Ok(Self {
            config,
            store,
            cache,
            ledger,
            executions,
            resolver,
            evaluator: ConditionEvaluator::new(),
            scheduler,
        })
    }

    /// Engine keeping execution records in memory.
    pub fn in_memory(config: EngineConfig, directory: Arc<dyn DirectoryLookup>) -> Result<Self, ValidationError> {
        Self::new(config, directory, Arc::new(MemoryExecutionStore::new()))
    }

    /// Resolve, filter and schedule for one event.
    ///
    /// Records are durable when this returns. Only store failures surface;
    /// directory and condition trouble is absorbed and logged.
    pub async fn evaluate(&self, subject_id: &SubjectId, event: &SecurityEvent) -> Result<EvaluationOutcome, PolicyError> {
        self.evaluate_at(subject_id, event, Utc::now()).await
    }

    /// [`Self::evaluate`] at an explicit instant.
    pub async fn evaluate_at(
        &self,
        subject_id: &SubjectId,
        event: &SecurityEvent,
        now: DateTime<Utc>,
    ) -> Result<EvaluationOutcome, PolicyError> {
        if &event.subject_id != subject_id {
            tracing::debug!(
                subject = %subject_id,
                event_subject = %event.subject_id,
                "evaluating event for a subject other than its producer-assigned one"
            );
        }
        let resolution = self.resolver.resolve(subject_id, now).await;
        let matched = self.evaluator.filter(&resolution.policies, event);
        let records = self
            .scheduler
            .schedule(&matched, &event.event_id, subject_id, now)
            .await?;

        tracing::info!(
            event_id = %event.event_id,
            subject = %subject_id,
            resolved = resolution.policies.len(),
            matched = matched.len(),
            scheduled = records.len(),
            source = %resolution.source,
            "event evaluated"
        );
        Ok(EvaluationOutcome {
            event_id: event.event_id.clone(),
            subject_id: subject_id.clone(),
            matched_policy_ids: matched.iter().map(|p| p.id).collect(),
            created_execution_record_ids: records.iter().map(|r| r.id).collect(),
            resolution_source: resolution.source,
        })
    }

    /// Resolve and filter without scheduling. Nothing is persisted.
    pub async fn preview(&self, subject_id: &SubjectId, event: &SecurityEvent, now: DateTime<Utc>) -> Preview {
        let resolution = self.resolver.resolve(subject_id, now).await;
        let matched = self.evaluator.filter(&resolution.policies, event);
        let planned = ActionScheduler::plan(&matched, &event.event_id, subject_id, now);
        Preview {
            matched_policy_ids: matched.iter().map(|p| p.id).collect(),
            resolution,
            planned,
        }
    }

    /// Effective policies for a subject.
    pub async fn resolve(&self, subject_id: &SubjectId) -> Resolution {
        self.resolver.resolve(subject_id, Utc::now()).await
    }

    /// Operator-initiated retry of a failed record.
    pub async fn retry(&self, execution_id: ExecutionId, actor: &str) -> Result<ExecutionRecord, PolicyError> {
        self.scheduler.retry(execution_id, actor, Utc::now()).await
    }

    /// Executor sharing this engine's stores.
    pub fn executor(&self, handlers: HandlerRegistry) -> Executor {
        Executor::new(
            &self.config,
            Arc::clone(&self.executions),
            Arc::clone(&self.store),
            Arc::clone(&self.ledger),
            handlers,
        )
    }

    /// Mark every policy with persisted execution records as referenced so
    /// its scope stays locked across restarts.
    pub async fn hydrate_references(&self) -> Result<usize, PolicyError> {
        let referenced = self.executions.referenced_policies().await?;
        let count = referenced.len();
        self.store.mark_referenced(referenced);
        Ok(count)
    }

    /// Drop a subject's cached resolution, e.g. after a directory change.
    pub fn invalidate_subject(&self, subject_id: &SubjectId) -> bool {
        CacheInvalidator::new(Arc::clone(&self.cache)).invalidate_subject(subject_id)
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Policy store.
    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Resolution cache.
    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    /// Audit ledger.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Execution record store.
    pub fn executions(&self) -> &Arc<dyn ExecutionStore> {
        &self.executions
    }
}
