//! # Engine Errors
//!
//! Structured error types for the policy engine, built with `thiserror`.
//!
//! Only [`ValidationError`] and [`PolicyError::NotFound`] surface to callers
//! of administrative operations. Resolution, evaluation and execution
//! failures are absorbed by the engine: they are logged and, where relevant,
//! captured on the execution record instead of aborting event processing.

use std::time::Duration;

use thiserror::Error;

use vigil_core::{ExecutionId, PolicyId, SubjectId};

use crate::directory::DirectoryError;
use crate::handlers::HandlerError;
use crate::journal::StoreError;
use crate::ledger::LedgerError;

/// Top-level error type for policy engine operations.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// Malformed input rejected before any state change.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("policy", "condition", "action", "execution").
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Durable execution store failure.
    #[error("execution store error: {0}")]
    Store(#[from] StoreError),

    /// Audit ledger failure. The associated mutation was not applied.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl PolicyError {
    pub(crate) fn policy_not_found(id: PolicyId) -> Self {
        Self::NotFound {
            entity: "policy",
            id: id.to_string(),
        }
    }
}

/// Input rejected at write time. No partial writes occur.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Policy names must be non-empty.
    #[error("policy name must not be empty")]
    EmptyName,

    /// Policy name exceeds the maximum length.
    #[error("policy name exceeds {max} characters")]
    NameTooLong {
        /// Maximum accepted length.
        max: usize,
    },

    /// Scope type is not one of global, group, user.
    #[error("unknown scope type: {0:?}")]
    UnknownScopeType(String),

    /// Group or user scope without a target value.
    #[error("{scope} scope requires a non-empty target")]
    ScopeTargetMissing {
        /// The scope type.
        scope: &'static str,
    },

    /// Global scope carrying a target value.
    #[error("global scope must not carry a target (got {target:?})")]
    ScopeTargetUnexpected {
        /// The offending target.
        target: String,
    },

    /// Group scope without a group kind.
    #[error("group scope requires a kind (department or role)")]
    GroupKindMissing,

    /// Scope change on a policy that already produced execution records.
    #[error("policy {0} has execution records; its scope can no longer change")]
    ScopeLocked(PolicyId),

    /// Condition operand incompatible with its operator or kind.
    #[error("invalid condition operand for {operator}: {reason}")]
    InvalidOperand {
        /// The operator name.
        operator: String,
        /// What is wrong with the operand.
        reason: String,
    },

    /// Malformed condition type.
    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    /// Unknown condition operator.
    #[error("unknown condition operator: {0:?}")]
    UnknownOperator(String),

    /// Malformed action type or configuration.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Delay outside the accepted range.
    #[error("action delay {delay_secs}s exceeds the maximum of {max_secs}s")]
    DelayTooLong {
        /// Requested delay in seconds.
        delay_secs: u64,
        /// Maximum accepted delay in seconds.
        max_secs: u64,
    },

    /// Retry requested for a record that is not in the failed state.
    #[error("execution {id} is {status} and cannot be retried")]
    NotRetryable {
        /// The execution record.
        id: ExecutionId,
        /// Its current status.
        status: String,
    },

    /// Engine configuration rejected.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Malformed identifier.
    #[error(transparent)]
    Identifier(#[from] vigil_core::ValidationError),
}

/// Resolution could not consult the directory.
///
/// Never returned to callers; the resolver logs it and falls back to global
/// scope.
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// Directory lookup failed or timed out.
    #[error("directory lookup for {subject} failed: {source}")]
    Directory {
        /// Subject being resolved.
        subject: SubjectId,
        /// Underlying directory failure.
        #[source]
        source: DirectoryError,
    },
}

/// A dispatch did not complete. Captured as the record's error detail.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// No handler is registered for the action type.
    #[error("no handler registered for action type {0:?}")]
    NoHandler(String),

    /// The handler reported a failure.
    #[error("handler {handler} failed: {source}")]
    Handler {
        /// Handler name.
        handler: String,
        /// Handler failure.
        #[source]
        source: HandlerError,
    },

    /// The handler did not finish within the execution horizon.
    #[error("execution horizon of {}s exceeded", .0.as_secs())]
    HorizonExceeded(Duration),
}

/// A cached policy id no longer refers to an active policy.
#[derive(Error, Debug)]
#[error("cache entry for {subject} references {policy_id}, which is missing or inactive")]
pub struct CacheInconsistency {
    /// Subject whose cache entry was inconsistent.
    pub subject: SubjectId,
    /// First stale policy id encountered.
    pub policy_id: PolicyId,
}
