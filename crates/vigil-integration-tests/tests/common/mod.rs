// Shared fixtures, included with `mod common;` by each test file.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use vigil_core::SubjectId;
use vigil_policy::handlers::{ActionDispatch, HandlerError, HandlerReceipt};
use vigil_policy::model::PolicyDraft;
use vigil_policy::{ActionHandler, EngineConfig, PolicyEngine, StaticDirectory, SubjectAttributes};

pub const ADMIN: &str = "admin@example.com";

pub fn subject(id: &str) -> SubjectId {
    SubjectId::new(id).unwrap()
}

pub fn draft(value: Value) -> PolicyDraft {
    serde_json::from_value(value).unwrap()
}

/// Directory with two engineers and one finance analyst.
pub fn directory() -> Arc<StaticDirectory> {
    Arc::new(StaticDirectory::with_entries([
        (
            subject("emp-1"),
            SubjectAttributes::new("emp-1")
                .with_department("engineering")
                .with_role("developer"),
        ),
        (
            subject("emp-2"),
            SubjectAttributes::new("emp-2")
                .with_department("engineering")
                .with_role("manager"),
        ),
        (
            subject("emp-3"),
            SubjectAttributes::new("emp-3")
                .with_department("finance")
                .with_role("analyst"),
        ),
    ]))
}

pub fn engine() -> PolicyEngine {
    PolicyEngine::in_memory(EngineConfig::default(), directory()).unwrap()
}

/// Handler that records every dispatch and answers with a fixed outcome.
#[derive(Default)]
pub struct RecordingHandler {
    pub dispatched: Mutex<Vec<ActionDispatch>>,
    pub fail: bool,
}

impl RecordingHandler {
    pub fn failing() -> Self {
        Self {
            dispatched: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn action_types(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .iter()
            .map(|d| d.action_type.clone())
            .collect()
    }
}

#[async_trait]
impl ActionHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn handle(&self, dispatch: &ActionDispatch) -> Result<HandlerReceipt, HandlerError> {
        self.dispatched.lock().push(dispatch.clone());
        if self.fail {
            Err(HandlerError::Unavailable("downstream offline".into()))
        } else {
            Ok(HandlerReceipt {
                reference: Some(format!("ticket-{}", dispatch.execution_id)),
            })
        }
    }
}
