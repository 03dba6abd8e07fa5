//! # Condition Evaluator
//!
//! Filters resolved policies down to those whose trigger expression holds
//! for an incoming [`SecurityEvent`].
//!
//! ## Semantics
//!
//! - `equals`, `contains` and `in` compare string forms. `equals` and `in`
//!   also accept numerically equal operands, so `90` equals `90.0`.
//! - `greater_than` and `less_than` coerce both sides to numbers; severity
//!   level names coerce to `low=1 .. critical=4`. Coercion failure is an
//!   [`EvaluationError`] and the condition is false.
//! - A missing attribute makes its condition false, except for the
//!   always-match sentinel which ignores the event entirely.
//! - Connectors fold strictly left to right with no precedence: `A OR B AND C`
//!   is `(A OR B) AND C`.
//! - A policy with no conditions matches every event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use vigil_core::{EventId, SubjectId};

use crate::model::{Condition, ConditionKind, Connector, Operator, Policy};

// ---------------------------------------------------------------------------
// Security events
// ---------------------------------------------------------------------------

/// An incoming security/compliance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Producer-assigned identifier; minted when absent.
    #[serde(default = "EventId::generate")]
    pub event_id: EventId,
    /// Subject the event concerns.
    pub subject_id: SubjectId,
    /// Event category (e.g. `data_exfiltration`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Severity label (e.g. `Critical`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    /// Producer risk score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    /// When the event occurred.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Additional producer-specific attributes.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl SecurityEvent {
    /// Create an event with a fresh id and no attributes.
    pub fn new(subject_id: SubjectId) -> Self {
        Self {
            event_id: EventId::generate(),
            subject_id,
            category: None,
            severity: None,
            risk_score: None,
            timestamp: Utc::now(),
            attributes: Map::new(),
        }
    }

    /// Set the severity label.
    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = Some(severity.into());
        self
    }

    /// Set the risk score.
    pub fn with_risk_score(mut self, score: f64) -> Self {
        self.risk_score = Some(score);
        self
    }

    /// Set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set an extra attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The attribute a condition of `kind` inspects, if present.
    pub fn attribute(&self, kind: &ConditionKind) -> Option<Value> {
        let value = match kind {
            ConditionKind::Always => return None,
            ConditionKind::Severity => self
                .severity
                .clone()
                .map(Value::String)
                .or_else(|| self.attributes.get("severity").cloned()),
            ConditionKind::RiskScore => self
                .risk_score
                .map(Value::from)
                .or_else(|| self.attributes.get("risk_score").cloned()),
            ConditionKind::Category => self
                .category
                .clone()
                .map(Value::String)
                .or_else(|| self.attributes.get("category").cloned()),
            ConditionKind::Frequency => self.attributes.get("frequency").cloned(),
            ConditionKind::Attribute(name) => self.attributes.get(name).cloned(),
        };
        value.filter(|v| !v.is_null())
    }
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

/// Numeric rank of a named severity level.
pub fn severity_rank(label: &str) -> Option<f64> {
    match label.trim().to_ascii_lowercase().as_str() {
        "info" | "informational" => Some(0.0),
        "low" => Some(1.0),
        "medium" => Some(2.0),
        "high" => Some(3.0),
        "critical" => Some(4.0),
        _ => None,
    }
}

/// Coerce a JSON value to a finite number.
pub fn coerce_number(value: &Value, kind: &ConditionKind) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().or_else(|| {
            if *kind == ConditionKind::Severity {
                severity_rank(s)
            } else {
                None
            }
        }),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

/// The text a value compares as under `equals`, `in` and `contains`.
///
/// Strings are taken verbatim. Integral numbers render without a fraction,
/// so the JSON numbers `90` and `90.0` share one form.
fn string_form(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        }),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Exact, case-sensitive comparison of string forms.
fn string_forms_equal(attribute: &Value, operand: &Value) -> bool {
    matches!(
        (string_form(attribute), string_form(operand)),
        (Some(a), Some(b)) if a == b
    )
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// A condition could not be evaluated. The condition counts as false.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// A numeric comparison met a non-numeric side.
    #[error("{kind} {operator}: {value} is not numeric")]
    NotNumeric {
        /// Condition type.
        kind: String,
        /// Operator.
        operator: &'static str,
        /// Offending value.
        value: String,
    },

    /// The operand's shape does not fit the operator.
    #[error("{kind} {operator}: unsupported operand {value}")]
    UnsupportedOperand {
        /// Condition type.
        kind: String,
        /// Operator.
        operator: &'static str,
        /// Offending operand.
        value: String,
    },
}

/// Evaluates policy condition lists against events.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Create an evaluator.
    pub fn new() -> Self {
        Self
    }

    /// Evaluate one condition.
    ///
    /// `Ok(false)` when the referenced attribute is missing.
    pub fn evaluate_condition(
        &self,
        condition: &Condition,
        event: &SecurityEvent,
    ) -> Result<bool, EvaluationError> {
        if condition.kind == ConditionKind::Always {
            return Ok(true);
        }
        let Some(attribute) = event.attribute(&condition.kind) else {
            return Ok(false);
        };
        let operand = &condition.value;
        let kind = &condition.kind;
        let operator = condition.operator.as_str();

        match condition.operator {
            Operator::Equals => Ok(string_forms_equal(&attribute, operand)),
            Operator::GreaterThan | Operator::LessThan => {
                let lhs = coerce_number(&attribute, kind).ok_or_else(|| EvaluationError::NotNumeric {
                    kind: kind.to_string(),
                    operator,
                    value: attribute.to_string(),
                })?;
                let rhs = coerce_number(operand, kind).ok_or_else(|| EvaluationError::NotNumeric {
                    kind: kind.to_string(),
                    operator,
                    value: operand.to_string(),
                })?;
                Ok(if condition.operator == Operator::GreaterThan {
                    lhs > rhs
                } else {
                    lhs < rhs
                })
            }
            Operator::Contains => {
                let needle = string_form(operand)
                    .filter(|_| !matches!(operand, Value::Array(_) | Value::Object(_)))
                    .ok_or_else(|| EvaluationError::UnsupportedOperand {
                        kind: kind.to_string(),
                        operator,
                        value: operand.to_string(),
                    })?;
                Ok(match &attribute {
                    Value::Array(items) => items
                        .iter()
                        .any(|item| string_form(item).as_deref() == Some(needle.as_str())),
                    other => string_form(other).is_some_and(|hay| hay.contains(&needle)),
                })
            }
            Operator::In => {
                let candidates: Vec<Value> = match operand {
                    Value::Array(items) => items.clone(),
                    Value::String(s) => s
                        .split(',')
                        .map(|part| Value::String(part.trim().to_string()))
                        .collect(),
                    other => {
                        return Err(EvaluationError::UnsupportedOperand {
                            kind: kind.to_string(),
                            operator,
                            value: other.to_string(),
                        })
                    }
                };
                Ok(candidates
                    .iter()
                    .any(|candidate| string_forms_equal(&attribute, candidate)))
            }
        }
    }

    /// Evaluate a policy's full condition expression.
    pub fn evaluate_policy(&self, policy: &Policy, event: &SecurityEvent) -> bool {
        let mut ordered: Vec<&Condition> = policy.conditions.iter().collect();
        ordered.sort_by_key(|c| c.position);

        let mut result: Option<bool> = None;
        let mut pending_connector = Connector::And;
        for condition in ordered {
            let value = match self.evaluate_condition(condition, event) {
                Ok(value) => value,
                Err(error) => {
                    tracing::debug!(
                        policy_id = %policy.id,
                        condition_id = %condition.id,
                        event_id = %event.event_id,
                        %error,
                        "condition evaluation failed; treating as false"
                    );
                    false
                }
            };
            result = Some(match (result, pending_connector) {
                (None, _) => value,
                (Some(acc), Connector::And) => acc && value,
                (Some(acc), Connector::Or) => acc || value,
            });
            pending_connector = condition.connector;
        }
        result.unwrap_or(true)
    }

    /// Keep the policies whose conditions hold, preserving input order.
    pub fn filter(&self, policies: &[Arc<Policy>], event: &SecurityEvent) -> Vec<Arc<Policy>> {
        policies
            .iter()
            .filter(|policy| self.evaluate_policy(policy, event))
            .cloned()
            .collect()
    }
}
