//! Audit ledger persistence: the hash chain mirrored to Postgres.
//!
//! Entries are appended by sequence number and never updated. Inserting an
//! already-persisted sequence is a no-op, so flushing the same tail twice is
//! harmless.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use vigil_core::{ContentDigest, PolicyId};
use vigil_policy::ledger::{verify_entries, ChainVerification, LedgerOperation, LedgerRecord};
use vigil_policy::LedgerEntry;

use super::decode_error;

/// Append entries in one transaction.
pub async fn append_entries(pool: &PgPool, entries: &[LedgerEntry]) -> Result<(), sqlx::Error> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for entry in entries {
        let record = serde_json::to_value(&entry.record).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query(
            "INSERT INTO ledger_entries (sequence, recorded_at, actor, entity_kind, entity_id,
             policy_id, operation, record, previous_digest, digest)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (sequence) DO NOTHING",
        )
        .bind(sequence_to_db(entry.sequence)?)
        .bind(entry.recorded_at)
        .bind(&entry.actor)
        .bind(&entry.entity_kind)
        .bind(&entry.entity_id)
        .bind(entry.policy_id.map(|id| *id.as_uuid()))
        .bind(entry.operation.as_str())
        .bind(&record)
        .bind(entry.previous_digest.to_hex())
        .bind(entry.digest.to_hex())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Load the whole chain in sequence order.
pub async fn load_all(pool: &PgPool) -> Result<Vec<LedgerEntry>, sqlx::Error> {
    let rows = sqlx::query_as::<_, LedgerEntryRow>(
        "SELECT sequence, recorded_at, actor, entity_kind, entity_id, policy_id,
         operation, record, previous_digest, digest
         FROM ledger_entries ORDER BY sequence ASC",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(LedgerEntryRow::into_entry).collect()
}

/// Highest persisted sequence, 0 when the table is empty.
pub async fn max_sequence(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence) FROM ledger_entries")
        .fetch_one(pool)
        .await?;
    Ok(max.map_or(0, |m| m.max(0) as u64))
}

/// Verify the persisted chain, reading at most `limit` entries from the start.
pub async fn verify_chain_integrity(pool: &PgPool, limit: i64) -> Result<ChainVerification, sqlx::Error> {
    let rows = sqlx::query_as::<_, LedgerEntryRow>(
        "SELECT sequence, recorded_at, actor, entity_kind, entity_id, policy_id,
         operation, record, previous_digest, digest
         FROM ledger_entries ORDER BY sequence ASC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let entries = rows
        .into_iter()
        .map(LedgerEntryRow::into_entry)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(verify_entries(&entries))
}

fn sequence_to_db(sequence: u64) -> Result<i64, sqlx::Error> {
    i64::try_from(sequence).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

/// Database row for ledger entries.
#[derive(sqlx::FromRow)]
struct LedgerEntryRow {
    sequence: i64,
    recorded_at: DateTime<Utc>,
    actor: String,
    entity_kind: String,
    entity_id: String,
    policy_id: Option<Uuid>,
    operation: String,
    record: serde_json::Value,
    previous_digest: String,
    digest: String,
}

impl LedgerEntryRow {
    fn into_entry(self) -> Result<LedgerEntry, sqlx::Error> {
        let sequence = u64::try_from(self.sequence).map_err(|e| decode_error("sequence", e))?;
        let operation: LedgerOperation = serde_json::from_value(serde_json::Value::String(self.operation))
            .map_err(|e| decode_error("operation", e))?;
        let record: LedgerRecord =
            serde_json::from_value(self.record).map_err(|e| decode_error("record", e))?;
        let previous_digest = ContentDigest::from_hex(&self.previous_digest)
            .ok_or_else(|| decode_error("previous_digest", "not a 32-byte hex digest"))?;
        let digest = ContentDigest::from_hex(&self.digest)
            .ok_or_else(|| decode_error("digest", "not a 32-byte hex digest"))?;

        Ok(LedgerEntry {
            sequence,
            recorded_at: self.recorded_at,
            actor: self.actor,
            entity_kind: self.entity_kind,
            entity_id: self.entity_id,
            policy_id: self.policy_id.map(PolicyId::from_uuid),
            operation,
            record,
            previous_digest,
            digest,
        })
    }
}
