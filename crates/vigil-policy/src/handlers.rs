//! # Action Handlers
//!
//! Handlers carry out remediation (notification, access restriction,
//! incident creation, monitoring changes). Their contracts are external; the
//! engine only delivers an [`ActionDispatch`] and records the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vigil_core::{ActionId, EventId, ExecutionId, PolicyId, SubjectId};

/// What a handler receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDispatch {
    /// Execution record being run.
    pub execution_id: ExecutionId,
    /// Owning policy.
    pub policy_id: PolicyId,
    /// Action being dispatched.
    pub action_id: ActionId,
    /// Action type.
    pub action_type: String,
    /// Action configuration at dispatch time.
    pub config: serde_json::Value,
    /// Subject of the triggering event.
    pub subject_id: SubjectId,
    /// Triggering event.
    pub event_id: EventId,
}

/// Successful handler outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerReceipt {
    /// Optional handler-specific reference (ticket id, message id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Handler failure. Always marks the record `failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The downstream system refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The downstream system could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The dispatch is malformed for this handler.
    #[error("invalid dispatch: {0}")]
    InvalidDispatch(String),
}

/// Carries out one kind of action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Handler name for logs.
    fn name(&self) -> &str;

    /// Carry out the action.
    async fn handle(&self, dispatch: &ActionDispatch) -> Result<HandlerReceipt, HandlerError>;
}

/// Selects a handler by action type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    fallback: Option<Arc<dyn ActionHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry")
            .field("types", &types)
            .field("fallback", &self.fallback.as_ref().map(|h| h.name().to_string()))
            .finish()
    }
}

impl HandlerRegistry {
    /// Registry with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry dispatching every type to `handler`.
    pub fn with_fallback(handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Some(handler),
        }
    }

    /// Register `handler` for `action_type`.
    pub fn register(&mut self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) -> &mut Self {
        self.handlers.insert(action_type.into(), handler);
        self
    }

    /// Set the handler used for unregistered types.
    pub fn set_fallback(&mut self, handler: Arc<dyn ActionHandler>) -> &mut Self {
        self.fallback = Some(handler);
        self
    }

    /// Handler for `action_type`, falling back when unregistered.
    pub fn resolve(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .get(action_type)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Logs each dispatch and succeeds. Development default.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHandler;

#[async_trait]
impl ActionHandler for TracingHandler {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn handle(&self, dispatch: &ActionDispatch) -> Result<HandlerReceipt, HandlerError> {
        tracing::info!(
            execution_id = %dispatch.execution_id,
            policy_id = %dispatch.policy_id,
            action_type = %dispatch.action_type,
            subject_id = %dispatch.subject_id,
            event_id = %dispatch.event_id,
            config = %dispatch.config,
            "action dispatched"
        );
        Ok(HandlerReceipt::default())
    }
}
