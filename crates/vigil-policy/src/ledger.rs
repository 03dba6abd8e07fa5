//! # Audit & Execution Ledger
//!
//! Append-only, hash-chained record of every policy/condition/action
//! mutation and every execution status transition.
//!
//! ## Chain
//!
//! Each entry's digest is `SHA-256(canonical(sequence, recorded_at, actor,
//! record, previous_digest))`. The first entry chains to
//! [`ContentDigest::ZERO`]. Editing or dropping any entry breaks every later
//! link, which [`Ledger::verify`] reports.
//!
//! ## Capacity
//!
//! With a non-zero capacity the in-memory window trims the oldest 10% once
//! the capacity is exceeded. Durable deployments flush entries (see
//! [`Ledger::since`]) before they can be trimmed; verification of a trimmed
//! window anchors on the first retained entry.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vigil_core::{
    sha256_digest, ActionId, CanonicalBytes, CanonicalizationError, ContentDigest, EventId,
    ExecutionId, PolicyId, SubjectId,
};

use crate::model::{Action, Condition, Policy};
use crate::scheduler::ExecutionStatus;

/// Ledger failure.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The entry could not be canonicalized for hashing.
    #[error("cannot digest ledger entry: {0}")]
    Canonicalization(#[from] CanonicalizationError),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOperation {
    /// Entity created.
    Created,
    /// Entity modified.
    Updated,
    /// Entity deleted.
    Deleted,
    /// Execution record created.
    Scheduled,
    /// Execution finished successfully.
    Succeeded,
    /// Execution failed.
    Failed,
    /// Execution skipped at dispatch.
    Skipped,
}

impl LedgerOperation {
    /// String value for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Scheduled => "scheduled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-entity audit payload with before/after values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum LedgerRecord {
    /// Policy created, updated or deleted (deletes carry the cascaded children).
    Policy {
        /// State before the mutation.
        before: Option<Box<Policy>>,
        /// State after the mutation.
        after: Option<Box<Policy>>,
    },
    /// Condition added or removed.
    Condition {
        /// Owning policy.
        policy_id: PolicyId,
        /// State before the mutation.
        before: Option<Condition>,
        /// State after the mutation.
        after: Option<Condition>,
    },
    /// Action added, updated or removed.
    Action {
        /// Owning policy.
        policy_id: PolicyId,
        /// State before the mutation.
        before: Option<Action>,
        /// State after the mutation.
        after: Option<Action>,
    },
    /// Execution record created or moved to a terminal status.
    Execution {
        /// The execution record.
        execution_id: ExecutionId,
        /// Owning policy.
        policy_id: PolicyId,
        /// Dispatched action.
        action_id: ActionId,
        /// Triggering event.
        event_id: EventId,
        /// Subject of the event.
        subject_id: SubjectId,
        /// Action type.
        action_type: String,
        /// Previous status; absent on creation.
        from: Option<ExecutionStatus>,
        /// New status.
        to: ExecutionStatus,
        /// Error or skip reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        /// Original record when this one is an operator retry.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_of: Option<ExecutionId>,
    },
}

impl LedgerRecord {
    /// Entity type name.
    pub fn entity_kind(&self) -> &'static str {
        match self {
            Self::Policy { .. } => "policy",
            Self::Condition { .. } => "condition",
            Self::Action { .. } => "action",
            Self::Execution { .. } => "execution",
        }
    }

    /// Identifier of the entity the record is about.
    pub fn entity_id(&self) -> String {
        match self {
            Self::Policy { before, after } => after
                .as_ref()
                .or(before.as_ref())
                .map(|p| p.id.to_string())
                .unwrap_or_default(),
            Self::Condition { before, after, .. } => after
                .as_ref()
                .or(before.as_ref())
                .map(|c| c.id.to_string())
                .unwrap_or_default(),
            Self::Action { before, after, .. } => after
                .as_ref()
                .or(before.as_ref())
                .map(|a| a.id.to_string())
                .unwrap_or_default(),
            Self::Execution { execution_id, .. } => execution_id.to_string(),
        }
    }

    /// Policy the record belongs to.
    pub fn policy_id(&self) -> Option<PolicyId> {
        match self {
            Self::Policy { before, after } => after.as_ref().or(before.as_ref()).map(|p| p.id),
            Self::Condition { policy_id, .. }
            | Self::Action { policy_id, .. }
            | Self::Execution { policy_id, .. } => Some(*policy_id),
        }
    }

    /// Operation implied by the before/after values.
    pub fn operation(&self) -> LedgerOperation {
        let (has_before, has_after) = match self {
            Self::Policy { before, after } => (before.is_some(), after.is_some()),
            Self::Condition { before, after, .. } => (before.is_some(), after.is_some()),
            Self::Action { before, after, .. } => (before.is_some(), after.is_some()),
            Self::Execution { from, to, .. } => {
                return match (from, to) {
                    (None, _) | (_, ExecutionStatus::Pending) => LedgerOperation::Scheduled,
                    (_, ExecutionStatus::Success) => LedgerOperation::Succeeded,
                    (_, ExecutionStatus::Failed) => LedgerOperation::Failed,
                    (_, ExecutionStatus::Skipped) => LedgerOperation::Skipped,
                }
            }
        };
        match (has_before, has_after) {
            (false, _) => LedgerOperation::Created,
            (true, true) => LedgerOperation::Updated,
            (true, false) => LedgerOperation::Deleted,
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One link of the ledger chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonic sequence number, starting at 1.
    pub sequence: u64,
    /// When the entry was appended (microsecond precision).
    pub recorded_at: DateTime<Utc>,
    /// Who performed the mutation (`engine` for executor transitions).
    pub actor: String,
    /// Entity type name.
    pub entity_kind: String,
    /// Entity identifier.
    pub entity_id: String,
    /// Owning policy.
    pub policy_id: Option<PolicyId>,
    /// Operation.
    pub operation: LedgerOperation,
    /// Audit payload.
    pub record: LedgerRecord,
    /// Digest of the preceding entry.
    pub previous_digest: ContentDigest,
    /// Digest of this entry.
    pub digest: ContentDigest,
}

#[derive(Serialize)]
struct DigestInput<'a> {
    sequence: u64,
    recorded_at: &'a DateTime<Utc>,
    actor: &'a str,
    record: &'a LedgerRecord,
    previous_digest: &'a ContentDigest,
}

fn compute_digest(
    sequence: u64,
    recorded_at: &DateTime<Utc>,
    actor: &str,
    record: &LedgerRecord,
    previous_digest: &ContentDigest,
) -> Result<ContentDigest, LedgerError> {
    let canonical = CanonicalBytes::new(&DigestInput {
        sequence,
        recorded_at,
        actor,
        record,
        previous_digest,
    })?;
    Ok(sha256_digest(&canonical))
}

impl LedgerEntry {
    /// Recompute this entry's digest from its contents.
    pub fn recompute_digest(&self) -> Result<ContentDigest, LedgerError> {
        compute_digest(
            self.sequence,
            &self.recorded_at,
            &self.actor,
            &self.record,
            &self.previous_digest,
        )
    }
}

/// Truncate to the precision durable storage keeps.
fn to_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(at.timestamp_micros()).unwrap_or(at)
}

// ---------------------------------------------------------------------------
// Queries and verification
// ---------------------------------------------------------------------------

/// Filter for [`Ledger::query`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerQuery {
    /// Entries about this entity, or owned by this policy id.
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Entries recorded at or after this instant.
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    /// Entries recorded strictly before this instant.
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    /// Entries with a sequence strictly greater than this.
    #[serde(default)]
    pub after_sequence: Option<u64>,
    /// Maximum number of entries returned.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LedgerQuery {
    fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(id) = &self.entity_id {
            let owned_by = entry.policy_id.is_some_and(|p| p.to_string() == *id);
            if entry.entity_id != *id && !owned_by {
                return false;
            }
        }
        if self.from.is_some_and(|from| entry.recorded_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| entry.recorded_at >= to) {
            return false;
        }
        if self.after_sequence.is_some_and(|seq| entry.sequence <= seq) {
            return false;
        }
        true
    }
}

/// Outcome of [`Ledger::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    /// Entries checked.
    pub total_entries: usize,
    /// Sequences whose digest or back-link does not match.
    pub broken_links: Vec<u64>,
    /// Whether the retained chain is intact.
    pub chain_valid: bool,
}

/// Check a sequence of entries for chain integrity.
pub fn verify_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> ChainVerification {
    let mut total = 0;
    let mut broken = Vec::new();
    let mut previous: Option<&LedgerEntry> = None;
    for entry in entries {
        total += 1;
        let link_ok = match previous {
            Some(prev) => {
                entry.previous_digest == prev.digest && entry.sequence == prev.sequence + 1
            }
            None => entry.sequence > 1 || entry.previous_digest == ContentDigest::ZERO,
        };
        let digest_ok = entry
            .recompute_digest()
            .is_ok_and(|digest| digest == entry.digest);
        if !(link_ok && digest_ok) {
            broken.push(entry.sequence);
        }
        previous = Some(entry);
    }
    ChainVerification {
        total_entries: total,
        chain_valid: broken.is_empty(),
        broken_links: broken,
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LedgerState {
    entries: VecDeque<LedgerEntry>,
    next_sequence: u64,
    head: ContentDigest,
}

/// Append-only hash-chained ledger.
#[derive(Debug)]
pub struct Ledger {
    state: Mutex<LedgerState>,
    capacity: usize,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Ledger {
    /// Create an empty ledger. A capacity of 0 keeps every entry.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                entries: VecDeque::new(),
                next_sequence: 1,
                head: ContentDigest::ZERO,
            }),
            capacity,
        }
    }

    /// Append a record on behalf of `actor`.
    ///
    /// On error nothing is appended.
    pub fn append(&self, actor: &str, record: LedgerRecord) -> Result<LedgerEntry, LedgerError> {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        let recorded_at = to_micros(Utc::now());
        let digest = compute_digest(sequence, &recorded_at, actor, &record, &state.head)?;
        let entry = LedgerEntry {
            sequence,
            recorded_at,
            actor: actor.to_string(),
            entity_kind: record.entity_kind().to_string(),
            entity_id: record.entity_id(),
            policy_id: record.policy_id(),
            operation: record.operation(),
            previous_digest: state.head,
            digest,
            record,
        };
        state.head = digest;
        state.next_sequence += 1;
        state.entries.push_back(entry.clone());
        if self.capacity > 0 && state.entries.len() > self.capacity {
            let trim = (self.capacity / 10).max(1);
            state.entries.drain(..trim);
        }
        tracing::debug!(
            sequence,
            actor,
            entity = %entry.entity_kind,
            entity_id = %entry.entity_id,
            operation = %entry.operation,
            "ledger entry appended"
        );
        Ok(entry)
    }

    /// Replace the ledger contents with previously persisted entries.
    ///
    /// Entries must be in sequence order; appends continue the chain from the
    /// last one.
    pub fn restore(&self, entries: Vec<LedgerEntry>) {
        let mut state = self.state.lock();
        match entries.last() {
            Some(last) => {
                state.next_sequence = last.sequence + 1;
                state.head = last.digest;
            }
            None => {
                state.next_sequence = 1;
                state.head = ContentDigest::ZERO;
            }
        }
        state.entries = entries.into();
    }

    /// Entries matching `query`, oldest first.
    pub fn query(&self, query: &LedgerQuery) -> Vec<LedgerEntry> {
        let state = self.state.lock();
        let matching = state.entries.iter().filter(|e| query.matches(e)).cloned();
        match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// Entries about `entity_id` or owned by the policy with that id.
    pub fn for_entity(&self, entity_id: &str) -> Vec<LedgerEntry> {
        self.query(&LedgerQuery {
            entity_id: Some(entity_id.to_string()),
            ..LedgerQuery::default()
        })
    }

    /// Entries recorded in `[from, to)`.
    pub fn in_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<LedgerEntry> {
        self.query(&LedgerQuery {
            from: Some(from),
            to: Some(to),
            ..LedgerQuery::default()
        })
    }

    /// Entries with a sequence greater than `sequence`.
    pub fn since(&self, sequence: u64) -> Vec<LedgerEntry> {
        self.query(&LedgerQuery {
            after_sequence: Some(sequence),
            ..LedgerQuery::default()
        })
    }

    /// Verify the retained chain.
    pub fn verify(&self) -> ChainVerification {
        let state = self.state.lock();
        verify_entries(state.entries.iter())
    }

    /// Sequence number of the most recent entry (0 when empty).
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().next_sequence - 1
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}
