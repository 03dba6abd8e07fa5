//! Policy persistence.
//!
//! Each policy is one row holding the full document, conditions and actions
//! included. The in-memory store is authoritative while running; rows are
//! written through after every successful mutation.

use sqlx::PgPool;
use uuid::Uuid;

use vigil_core::PolicyId;
use vigil_policy::Policy;

use super::decode_error;

/// Insert or replace a policy.
pub async fn upsert(pool: &PgPool, policy: &Policy) -> Result<(), sqlx::Error> {
    let document = serde_json::to_value(policy).map_err(|e| {
        tracing::error!(error = %e, policy_id = %policy.id, "failed to serialize policy");
        sqlx::Error::Encode(Box::new(e))
    })?;

    sqlx::query(
        "INSERT INTO policies (id, name, scope, priority, active, document, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            scope = EXCLUDED.scope,
            priority = EXCLUDED.priority,
            active = EXCLUDED.active,
            document = EXCLUDED.document,
            updated_at = EXCLUDED.updated_at",
    )
    .bind(policy.id.as_uuid())
    .bind(&policy.name)
    .bind(policy.scope.to_string())
    .bind(policy.priority)
    .bind(policy.active)
    .bind(&document)
    .bind(policy.created_at)
    .bind(policy.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a policy. Returns whether a row was removed.
pub async fn delete(pool: &PgPool, id: PolicyId) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM policies WHERE id = $1")
        .bind(id.as_uuid())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Load every policy, oldest first.
pub async fn load_all(pool: &PgPool) -> Result<Vec<Policy>, sqlx::Error> {
    let rows = sqlx::query_as::<_, PolicyRow>(
        "SELECT id, document FROM policies ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(PolicyRow::into_policy).collect()
}

/// Database row for policies.
#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: Uuid,
    document: serde_json::Value,
}

impl PolicyRow {
    fn into_policy(self) -> Result<Policy, sqlx::Error> {
        let policy: Policy =
            serde_json::from_value(self.document).map_err(|e| decode_error("document", e))?;
        if *policy.id.as_uuid() != self.id {
            return Err(decode_error(
                "document",
                format!("embedded id {} does not match row id {}", policy.id, self.id),
            ));
        }
        Ok(policy)
    }
}
