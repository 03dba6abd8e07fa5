//! Durable execution store backed by Postgres.
//!
//! Claiming follows the same queue rule as the in-memory store: a record is
//! handed out only when it is the head of its `(policy_id, event_id)` queue
//! and no other record of that queue is in flight. `FOR UPDATE SKIP LOCKED`
//! keeps concurrent executors from claiming the same row.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use vigil_core::{ActionId, EventId, ExecutionId, PolicyId, SubjectId};
use vigil_policy::journal::{ExecutionFilter, StoreError, INTERRUPTED_DETAIL};
use vigil_policy::{ExecutionRecord, ExecutionStatus, ExecutionStore};

const COLUMNS: &str = "id, policy_id, action_id, event_id, subject_id, action_type, execution_order,
     status, scheduled_at, started_at, completed_at, error_detail, retry_of, created_at";

/// Postgres implementation of [`ExecutionStore`].
#[derive(Debug, Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    /// Wrap a connected pool. Migrations must already be applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    tracing::error!(error = %err, "execution store query failed");
    StoreError::Backend(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn insert_batch(&self, records: &[ExecutionRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for record in records {
            let result = sqlx::query(
                "INSERT INTO execution_records (id, policy_id, action_id, event_id, subject_id,
                 action_type, execution_order, status, scheduled_at, started_at, completed_at,
                 error_detail, retry_of, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(record.id.as_uuid())
            .bind(record.policy_id.as_uuid())
            .bind(record.action_id.as_uuid())
            .bind(record.event_id.as_str())
            .bind(record.subject_id.as_str())
            .bind(&record.action_type)
            .bind(i64::from(record.execution_order))
            .bind(record.status.as_str())
            .bind(record.scheduled_at)
            .bind(record.started_at)
            .bind(record.completed_at)
            .bind(&record.error_detail)
            .bind(record.retry_of.map(|id| *id.as_uuid()))
            .bind(record.created_at)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(err) if is_unique_violation(&err) => return Err(StoreError::Duplicate(record.id)),
                Err(err) => return Err(backend(err)),
            }
        }
        tx.commit().await.map_err(backend)
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query_as::<_, ExecutionRecordRow>(&format!(
            "SELECT {COLUMNS} FROM execution_records WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(ExecutionRecordRow::into_record).transpose()
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, ExecutionRecordRow>(&format!(
            "UPDATE execution_records SET started_at = $1
             WHERE id IN (
                SELECT c.id FROM execution_records c
                WHERE c.status = 'pending'
                  AND c.started_at IS NULL
                  AND c.scheduled_at <= $1
                  AND NOT EXISTS (
                    SELECT 1 FROM execution_records s
                    WHERE s.policy_id = c.policy_id
                      AND s.event_id = c.event_id
                      AND s.id <> c.id
                      AND s.status = 'pending'
                      AND (s.started_at IS NOT NULL
                           OR (s.execution_order, s.scheduled_at, s.id)
                              < (c.execution_order, c.scheduled_at, c.id)))
                ORDER BY c.scheduled_at, c.execution_order, c.id
                LIMIT $2
                FOR UPDATE SKIP LOCKED)
             RETURNING {COLUMNS}"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut claimed = rows
            .into_iter()
            .map(ExecutionRecordRow::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|r| (r.scheduled_at, r.execution_order, r.id));
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
        let row = sqlx::query_as::<_, ExecutionRecordRow>(&format!(
            "UPDATE execution_records
             SET status = $2, completed_at = $3, started_at = COALESCE(started_at, $3), error_detail = $4
             WHERE id = $1 AND status = 'pending'
             RETURNING {COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(at)
        .bind(&detail)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => row.into_record(),
            None => match self.get(id).await? {
                Some(existing) => Err(StoreError::TerminalStatus {
                    id,
                    status: existing.status,
                }),
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    async fn reap_stale(&self, cutoff: DateTime<Utc>, at: DateTime<Utc>) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionRecordRow>(&format!(
            "UPDATE execution_records
             SET status = 'failed', completed_at = $2, error_detail = $3
             WHERE status = 'pending' AND started_at IS NOT NULL AND started_at < $1
             RETURNING {COLUMNS}"
        ))
        .bind(cutoff)
        .bind(at)
        .bind(INTERRUPTED_DETAIL)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(ExecutionRecordRow::into_record).collect()
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>, StoreError> {
        let limit = filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query_as::<_, ExecutionRecordRow>(&format!(
            "SELECT {COLUMNS} FROM execution_records
             WHERE ($1::uuid IS NULL OR policy_id = $1)
               AND ($2::text IS NULL OR event_id = $2)
               AND ($3::text IS NULL OR subject_id = $3)
               AND ($4::text IS NULL OR status = $4)
             ORDER BY scheduled_at, execution_order, id
             LIMIT $5"
        ))
        .bind(filter.policy_id.map(|id| *id.as_uuid()))
        .bind(filter.event_id.as_ref().map(|e| e.as_str().to_string()))
        .bind(filter.subject_id.as_ref().map(|s| s.as_str().to_string()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(ExecutionRecordRow::into_record).collect()
    }

    async fn references_policy(&self, policy_id: PolicyId) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM execution_records WHERE policy_id = $1)",
        )
        .bind(policy_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(backend)
    }

    async fn referenced_policies(&self) -> Result<Vec<PolicyId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT policy_id FROM execution_records ORDER BY policy_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(ids.into_iter().map(PolicyId::from_uuid).collect())
    }

    async fn status_counts(&self) -> Result<BTreeMap<ExecutionStatus, u64>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM execution_records GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;

        let mut counts: BTreeMap<ExecutionStatus, u64> =
            ExecutionStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for (status, count) in rows {
            let status = ExecutionStatus::from_str(&status).map_err(StoreError::Backend)?;
            counts.insert(status, count.max(0) as u64);
        }
        Ok(counts)
    }
}

/// Database row for execution records.
#[derive(sqlx::FromRow)]
struct ExecutionRecordRow {
    id: Uuid,
    policy_id: Uuid,
    action_id: Uuid,
    event_id: String,
    subject_id: String,
    action_type: String,
    execution_order: i64,
    status: String,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_detail: Option<String>,
    retry_of: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl ExecutionRecordRow {
    fn into_record(self) -> Result<ExecutionRecord, StoreError> {
        let corrupt = |column: &str, message: String| {
            StoreError::Backend(format!("execution {} has invalid {column}: {message}", self.id))
        };
        let event_id = EventId::new(self.event_id.clone()).map_err(|e| corrupt("event_id", e.to_string()))?;
        let subject_id =
            SubjectId::new(self.subject_id.clone()).map_err(|e| corrupt("subject_id", e.to_string()))?;
        let status = ExecutionStatus::from_str(&self.status).map_err(|e| corrupt("status", e))?;
        let execution_order =
            u32::try_from(self.execution_order).map_err(|e| corrupt("execution_order", e.to_string()))?;

        Ok(ExecutionRecord {
            id: ExecutionId::from_uuid(self.id),
            policy_id: PolicyId::from_uuid(self.policy_id),
            action_id: ActionId::from_uuid(self.action_id),
            event_id,
            subject_id,
            action_type: self.action_type,
            execution_order,
            status,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_detail: self.error_detail,
            retry_of: self.retry_of.map(ExecutionId::from_uuid),
            created_at: self.created_at,
        })
    }
}
