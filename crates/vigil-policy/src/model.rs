//! # Policy Model
//!
//! Policies bundle an applicability [`Scope`], trigger [`Condition`]s and
//! response [`Action`]s.
//!
//! ## Scope
//!
//! A scope is exactly one of global, group (department or role) or user.
//! The wire form is flat (`{"type": "group", "kind": "department",
//! "target": "R&D"}`) and is validated on deserialization, so a global scope
//! carrying a target or a group scope without one never reaches the store.
//!
//! ## Actions
//!
//! Action configuration is a discriminated union keyed by action type with a
//! typed configuration per known type. Unknown types are preserved as a
//! generic key-value map so newer producers do not break older engines.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use vigil_core::{ActionId, ConditionId, PolicyId};

use crate::config::{clamped_seconds, MAX_ACTION_DELAY_SECS};
use crate::directory::SubjectAttributes;
use crate::error::ValidationError;
use crate::evaluation::coerce_number;

/// Maximum policy name length.
pub const MAX_NAME_LEN: usize = 200;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Attribute a group scope matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// Subject's department.
    Department,
    /// Subject's role.
    Role,
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Department => f.write_str("department"),
            Self::Role => f.write_str("role"),
        }
    }
}

/// Which subjects a policy applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScopeRepr", into = "ScopeRepr")]
pub enum Scope {
    /// Every subject.
    Global,
    /// Subjects whose department or role equals `target`.
    Group {
        /// Attribute compared against the target.
        kind: GroupKind,
        /// Department or role name.
        target: String,
    },
    /// The single subject whose directory identifier equals `target`.
    User {
        /// Directory identifier.
        target: String,
    },
}

impl Scope {
    /// Scope type name.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Group { .. } => "group",
            Self::User { .. } => "user",
        }
    }

    /// The target value, if the scope carries one.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::Group { target, .. } | Self::User { target } => Some(target),
        }
    }

    /// Whether this scope covers a subject with the given attributes.
    ///
    /// Without attributes (directory unreachable) only global scope applies.
    pub fn applies_to(&self, attributes: Option<&SubjectAttributes>) -> bool {
        match (self, attributes) {
            (Self::Global, _) => true,
            (_, None) => false,
            (Self::Group { kind, target }, Some(attrs)) => {
                let value = match kind {
                    GroupKind::Department => attrs.department.as_deref(),
                    GroupKind::Role => attrs.role.as_deref(),
                };
                value.is_some_and(|v| targets_match(v, target))
            }
            (Self::User { target }, Some(attrs)) => targets_match(&attrs.identifier, target),
        }
    }
}

/// Scope targets compare case-insensitively (ASCII) after trimming.
pub fn targets_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Group { kind, target } => write!(f, "group:{kind}:{target}"),
            Self::User { target } => write!(f, "user:{target}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScopeRepr {
    #[serde(rename = "type")]
    scope_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<GroupKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

impl TryFrom<ScopeRepr> for Scope {
    type Error = ValidationError;

    fn try_from(repr: ScopeRepr) -> Result<Self, Self::Error> {
        let target = repr
            .target
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        match repr.scope_type.trim().to_ascii_lowercase().as_str() {
            "global" => match target {
                Some(target) => Err(ValidationError::ScopeTargetUnexpected { target }),
                None => Ok(Self::Global),
            },
            "group" => {
                let kind = repr.kind.ok_or(ValidationError::GroupKindMissing)?;
                let target = target.ok_or(ValidationError::ScopeTargetMissing { scope: "group" })?;
                Ok(Self::Group { kind, target })
            }
            "user" => {
                let target = target.ok_or(ValidationError::ScopeTargetMissing { scope: "user" })?;
                Ok(Self::User { target })
            }
            _ => Err(ValidationError::UnknownScopeType(repr.scope_type)),
        }
    }
}

impl From<Scope> for ScopeRepr {
    fn from(scope: Scope) -> Self {
        let scope_type = scope.label().to_string();
        match scope {
            Scope::Global => Self {
                scope_type,
                kind: None,
                target: None,
            },
            Scope::Group { kind, target } => Self {
                scope_type,
                kind: Some(kind),
                target: Some(target),
            },
            Scope::User { target } => Self {
                scope_type,
                kind: None,
                target: Some(target),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// What a condition inspects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConditionKind {
    /// Event severity (named levels coerce to 0-4 in numeric comparisons).
    Severity,
    /// Event risk score.
    RiskScore,
    /// Event frequency counter.
    Frequency,
    /// Event category.
    Category,
    /// Always-match sentinel; ignores the event entirely.
    Always,
    /// Any other event attribute, by name.
    Attribute(String),
}

impl ConditionKind {
    /// Canonical name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Severity => "severity",
            Self::RiskScore => "risk_score",
            Self::Frequency => "frequency",
            Self::Category => "category",
            Self::Always => "always",
            Self::Attribute(name) => name,
        }
    }
}

impl TryFrom<String> for ConditionKind {
    type Error = ValidationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(ValidationError::InvalidCondition(
                "condition type must not be empty".into(),
            ));
        }
        let normalized = name.to_ascii_lowercase().replace('-', "_");
        Ok(match normalized.as_str() {
            "severity" => Self::Severity,
            "risk_score" => Self::RiskScore,
            "frequency" => Self::Frequency,
            "category" => Self::Category,
            "always" | "always_match" => Self::Always,
            _ => Self::Attribute(name.to_string()),
        })
    }
}

impl From<ConditionKind> for String {
    fn from(kind: ConditionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// String equality (numeric equality when both sides are numbers).
    Equals,
    /// Numeric greater-than.
    GreaterThan,
    /// Numeric less-than.
    LessThan,
    /// Substring, or membership when the attribute is a list.
    Contains,
    /// Attribute is one of the operand's values.
    In,
}

impl Operator {
    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::Contains => "contains",
            Self::In => "in",
        }
    }
}

impl FromStr for Operator {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "equals" => Ok(Self::Equals),
            "greater_than" => Ok(Self::GreaterThan),
            "less_than" => Ok(Self::LessThan),
            "contains" => Ok(Self::Contains),
            "in" => Ok(Self::In),
            _ => Err(ValidationError::UnknownOperator(s.to_string())),
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical connector joining a condition to the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Connector {
    /// Both sides must hold.
    #[default]
    #[serde(alias = "and")]
    And,
    /// Either side may hold.
    #[serde(alias = "or")]
    Or,
}

/// A trigger predicate owned by a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition identifier.
    pub id: ConditionId,
    /// What the condition inspects.
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    /// Comparison operator.
    pub operator: Operator,
    /// Operand compared against the event attribute.
    pub value: Value,
    /// Connector to the next condition.
    #[serde(default)]
    pub connector: Connector,
    /// Declared evaluation order.
    pub position: u32,
}

/// Input for creating a condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionDraft {
    /// What the condition inspects.
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    /// Comparison operator.
    pub operator: Operator,
    /// Operand.
    #[serde(default)]
    pub value: Value,
    /// Connector to the next condition.
    #[serde(default)]
    pub connector: Connector,
    /// Declared order; appended after existing conditions when absent.
    #[serde(default)]
    pub position: Option<u32>,
}

impl Condition {
    /// Validate a draft and mint a condition.
    pub fn from_draft(draft: ConditionDraft, default_position: u32) -> Result<Self, ValidationError> {
        validate_operand(&draft.kind, draft.operator, &draft.value)?;
        Ok(Self {
            id: ConditionId::new(),
            kind: draft.kind,
            operator: draft.operator,
            value: draft.value,
            connector: draft.connector,
            position: draft.position.unwrap_or(default_position),
        })
    }
}

/// Reject operands the evaluator could never match.
fn validate_operand(kind: &ConditionKind, operator: Operator, value: &Value) -> Result<(), ValidationError> {
    if *kind == ConditionKind::Always {
        return Ok(());
    }
    let invalid = |reason: &str| ValidationError::InvalidOperand {
        operator: operator.to_string(),
        reason: reason.to_string(),
    };
    match operator {
        Operator::GreaterThan | Operator::LessThan => {
            coerce_number(value, kind).ok_or_else(|| invalid("operand must be numeric"))?;
        }
        Operator::Equals | Operator::Contains => {
            if !matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                return Err(invalid("operand must be a string, number or boolean"));
            }
        }
        Operator::In => match value {
            Value::Array(items) if items.is_empty() => {
                return Err(invalid("operand list must not be empty"));
            }
            Value::Array(items) => {
                if items
                    .iter()
                    .any(|v| !matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)))
                {
                    return Err(invalid("operand list must contain only scalars"));
                }
            }
            Value::String(s) if s.trim().is_empty() => {
                return Err(invalid("operand list must not be empty"));
            }
            Value::String(_) => {}
            _ => return Err(invalid("operand must be a list or comma-separated string")),
        },
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Notify people through a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Delivery channel (email, slack, webhook...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Who receives the alert.
    pub recipients: Vec<String>,
    /// Optional message template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Open an incident and hand it to a team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalateConfig {
    /// Team or role receiving the incident.
    pub to: String,
    /// Incident severity label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_severity: Option<String>,
}

/// Revoke access to resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictAccessConfig {
    /// Resources to restrict.
    pub resources: Vec<String>,
    /// How long the restriction lasts; indefinite when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

/// Raise the monitoring level for the subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Target monitoring level.
    pub level: String,
    /// How long the raised level lasts; indefinite when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

/// Action type with its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub enum ActionSpec {
    /// Send a notification.
    Alert(AlertConfig),
    /// Create an incident.
    Escalate(EscalateConfig),
    /// Restrict access.
    RestrictAccess(RestrictAccessConfig),
    /// Change monitoring level.
    IncreaseMonitoring(MonitoringConfig),
    /// Unknown type, kept verbatim.
    Other {
        /// Action type name.
        action_type: String,
        /// Opaque configuration.
        config: Map<String, Value>,
    },
}

impl ActionSpec {
    /// Action type name used for handler selection.
    pub fn action_type(&self) -> &str {
        match self {
            Self::Alert(_) => "alert",
            Self::Escalate(_) => "escalate",
            Self::RestrictAccess(_) => "restrict-access",
            Self::IncreaseMonitoring(_) => "increase-monitoring",
            Self::Other { action_type, .. } => action_type,
        }
    }

    /// Configuration payload delivered to handlers.
    pub fn config(&self) -> Value {
        Value::Object(RawAction::from(self.clone()).config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawAction {
    #[serde(rename = "type")]
    action_type: String,
    #[serde(default)]
    config: Map<String, Value>,
}

fn typed_config<T: serde::de::DeserializeOwned>(action_type: &str, config: Map<String, Value>) -> Result<T, ValidationError> {
    serde_json::from_value(Value::Object(config))
        .map_err(|e| ValidationError::InvalidAction(format!("{action_type} config: {e}")))
}

fn config_map<T: Serialize>(config: &T) -> Map<String, Value> {
    match serde_json::to_value(config) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl TryFrom<RawAction> for ActionSpec {
    type Error = ValidationError;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        let name = raw.action_type.trim();
        let normalized = name.to_ascii_lowercase().replace('_', "-");
        let spec = match normalized.as_str() {
            "alert" => {
                let config: AlertConfig = typed_config(&normalized, raw.config)?;
                if config.recipients.iter().all(|r| r.trim().is_empty()) {
                    return Err(ValidationError::InvalidAction(
                        "alert requires at least one recipient".into(),
                    ));
                }
                Self::Alert(config)
            }
            "escalate" => {
                let config: EscalateConfig = typed_config(&normalized, raw.config)?;
                if config.to.trim().is_empty() {
                    return Err(ValidationError::InvalidAction(
                        "escalate requires a target team".into(),
                    ));
                }
                Self::Escalate(config)
            }
            "restrict-access" => {
                let config: RestrictAccessConfig = typed_config(&normalized, raw.config)?;
                if config.resources.iter().all(|r| r.trim().is_empty()) {
                    return Err(ValidationError::InvalidAction(
                        "restrict-access requires at least one resource".into(),
                    ));
                }
                Self::RestrictAccess(config)
            }
            "increase-monitoring" => {
                let config: MonitoringConfig = typed_config(&normalized, raw.config)?;
                if config.level.trim().is_empty() {
                    return Err(ValidationError::InvalidAction(
                        "increase-monitoring requires a level".into(),
                    ));
                }
                Self::IncreaseMonitoring(config)
            }
            "" => {
                return Err(ValidationError::InvalidAction(
                    "action type must not be empty".into(),
                ))
            }
            _ => {
                if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
                    return Err(ValidationError::InvalidAction(format!(
                        "action type {name:?} contains whitespace or control characters"
                    )));
                }
                Self::Other {
                    action_type: name.to_string(),
                    config: raw.config,
                }
            }
        };
        Ok(spec)
    }
}

impl From<ActionSpec> for RawAction {
    fn from(spec: ActionSpec) -> Self {
        let action_type = spec.action_type().to_string();
        let config = match spec {
            ActionSpec::Alert(c) => config_map(&c),
            ActionSpec::Escalate(c) => config_map(&c),
            ActionSpec::RestrictAccess(c) => config_map(&c),
            ActionSpec::IncreaseMonitoring(c) => config_map(&c),
            ActionSpec::Other { config, .. } => config,
        };
        Self {
            action_type,
            config,
        }
    }
}

/// A response action owned by a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action identifier.
    pub id: ActionId,
    /// Type and configuration.
    pub action: ActionSpec,
    /// Position within the policy's ordered action sequence.
    pub execution_order: u32,
    /// Delay between scheduling and due time, in seconds.
    pub delay_secs: u64,
    /// Disabled actions are not scheduled and are skipped at dispatch.
    pub enabled: bool,
}

impl Action {
    /// Delay as a duration.
    pub fn delay(&self) -> chrono::Duration {
        clamped_seconds(self.delay_secs)
    }

    /// Validate a draft and mint an action.
    pub fn from_draft(draft: ActionDraft, default_order: u32) -> Result<Self, ValidationError> {
        validate_delay(draft.delay_secs)?;
        Ok(Self {
            id: ActionId::new(),
            action: draft.action,
            execution_order: draft.execution_order.unwrap_or(default_order),
            delay_secs: draft.delay_secs,
            enabled: draft.enabled,
        })
    }

    /// Apply a patch, validating the result.
    pub fn patched(&self, patch: ActionPatch) -> Result<Self, ValidationError> {
        let mut next = self.clone();
        if let Some(spec) = patch.action {
            next.action = spec;
        }
        if let Some(order) = patch.execution_order {
            next.execution_order = order;
        }
        if let Some(delay) = patch.delay_secs {
            validate_delay(delay)?;
            next.delay_secs = delay;
        }
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        Ok(next)
    }
}

fn validate_delay(delay_secs: u64) -> Result<(), ValidationError> {
    if delay_secs > MAX_ACTION_DELAY_SECS {
        return Err(ValidationError::DelayTooLong {
            delay_secs,
            max_secs: MAX_ACTION_DELAY_SECS,
        });
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

/// Input for creating an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDraft {
    /// Type and configuration.
    pub action: ActionSpec,
    /// Appended after existing actions when absent.
    #[serde(default)]
    pub execution_order: Option<u32>,
    /// Delay in seconds.
    #[serde(default)]
    pub delay_secs: u64,
    /// Whether the action is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Partial update of an action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionPatch {
    /// Replacement type and configuration.
    #[serde(default)]
    pub action: Option<ActionSpec>,
    /// New execution order.
    #[serde(default)]
    pub execution_order: Option<u32>,
    /// New delay in seconds.
    #[serde(default)]
    pub delay_secs: Option<u64>,
    /// Enable or disable.
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl ActionPatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.action.is_none()
            && self.execution_order.is_none()
            && self.delay_secs.is_none()
            && self.enabled.is_none()
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// An organizational rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy identifier.
    pub id: PolicyId,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Which subjects the policy applies to.
    pub scope: Scope,
    /// Higher priority resolves first.
    pub priority: i32,
    /// Inactive policies are never resolved.
    pub active: bool,
    /// Trigger conditions, ordered by position.
    pub conditions: Vec<Condition>,
    /// Response actions, ordered by execution order.
    pub actions: Vec<Action>,
    /// Creation time; the secondary resolution sort key.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Validate a draft and mint a policy.
    pub fn from_draft(draft: PolicyDraft, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let name = validate_name(&draft.name)?;
        let conditions = draft
            .conditions
            .into_iter()
            .enumerate()
            .map(|(i, c)| Condition::from_draft(c, u32::try_from(i).unwrap_or(u32::MAX)))
            .collect::<Result<Vec<_>, _>>()?;
        let actions = draft
            .actions
            .into_iter()
            .enumerate()
            .map(|(i, a)| Action::from_draft(a, u32::try_from(i).unwrap_or(u32::MAX)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut policy = Self {
            id: PolicyId::new(),
            name,
            description: normalize_description(draft.description),
            scope: draft.scope,
            priority: draft.priority,
            active: draft.active,
            conditions,
            actions,
            created_at: now,
            updated_at: now,
        };
        policy.normalize();
        Ok(policy)
    }

    /// Restore sort order of conditions and actions.
    pub(crate) fn normalize(&mut self) {
        self.conditions.sort_by_key(|c| c.position);
        self.actions.sort_by_key(|a| a.execution_order);
    }

    /// Position after the last condition.
    pub fn next_condition_position(&self) -> u32 {
        self.conditions
            .iter()
            .map(|c| c.position.saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    /// Execution order after the last action.
    pub fn next_execution_order(&self) -> u32 {
        self.actions
            .iter()
            .map(|a| a.execution_order.saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    /// Look up an owned action.
    pub fn action(&self, id: ActionId) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    /// Look up an owned condition.
    pub fn condition(&self, id: ConditionId) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.id == id)
    }

    /// Enabled actions in execution order.
    pub fn enabled_actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.enabled)
    }
}

fn validate_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong { max: MAX_NAME_LEN });
    }
    Ok(trimmed.to_string())
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

/// Input for creating a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDraft {
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Applicability scope.
    pub scope: Scope,
    /// Resolution priority.
    #[serde(default)]
    pub priority: i32,
    /// Whether the policy is active.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Trigger conditions.
    #[serde(default)]
    pub conditions: Vec<ConditionDraft>,
    /// Response actions.
    #[serde(default)]
    pub actions: Vec<ActionDraft>,
}

/// Partial update of a policy's own fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyPatch {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description; an empty string clears it.
    #[serde(default)]
    pub description: Option<String>,
    /// New scope. Rejected once the policy has execution records.
    #[serde(default)]
    pub scope: Option<Scope>,
    /// New priority.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Activate or deactivate.
    #[serde(default)]
    pub active: Option<bool>,
}

impl PolicyPatch {
    /// Apply the patch to `policy`, validating the result.
    pub fn apply(self, policy: &Policy, now: DateTime<Utc>) -> Result<Policy, ValidationError> {
        let mut next = policy.clone();
        if let Some(name) = self.name {
            next.name = validate_name(&name)?;
        }
        if let Some(description) = self.description {
            next.description = normalize_description(Some(description));
        }
        if let Some(scope) = self.scope {
            next.scope = scope;
        }
        if let Some(priority) = self.priority {
            next.priority = priority;
        }
        if let Some(active) = self.active {
            next.active = active;
        }
        next.updated_at = now;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alert_json() -> Value {
        json!({"type": "alert", "config": {"recipients": ["soc@example.com"]}})
    }

    #[test]
    fn scope_deserializes_each_variant() {
        let global: Scope = serde_json::from_value(json!({"type": "global"})).unwrap();
        assert_eq!(global, Scope::Global);
        let group: Scope =
            serde_json::from_value(json!({"type": "group", "kind": "department", "target": " R&D "}))
                .unwrap();
        assert_eq!(
            group,
            Scope::Group {
                kind: GroupKind::Department,
                target: "R&D".into()
            }
        );
        let user: Scope = serde_json::from_value(json!({"type": "user", "target": "emp-1"})).unwrap();
        assert_eq!(user.target(), Some("emp-1"));
    }

    #[test]
    fn global_scope_with_target_rejected() {
        let err = serde_json::from_value::<Scope>(json!({"type": "global", "target": "x"})).unwrap_err();
        assert!(err.to_string().contains("global scope must not carry a target"));
    }

    #[test]
    fn group_scope_without_target_rejected() {
        assert!(serde_json::from_value::<Scope>(json!({"type": "group", "kind": "role"})).is_err());
        assert!(serde_json::from_value::<Scope>(json!({"type": "group", "target": "x"})).is_err());
        assert!(serde_json::from_value::<Scope>(json!({"type": "user", "target": "  "})).is_err());
        assert!(serde_json::from_value::<Scope>(json!({"type": "team", "target": "x"})).is_err());
    }

    #[test]
    fn scope_serializes_flat() {
        let scope = Scope::Group {
            kind: GroupKind::Role,
            target: "contractor".into(),
        };
        assert_eq!(
            serde_json::to_value(&scope).unwrap(),
            json!({"type": "group", "kind": "role", "target": "contractor"})
        );
        assert_eq!(serde_json::to_value(Scope::Global).unwrap(), json!({"type": "global"}));
    }

    #[test]
    fn scope_applicability() {
        let attrs = SubjectAttributes::new("emp-1")
            .with_department("R&D")
            .with_role("engineer");
        assert!(Scope::Global.applies_to(Some(&attrs)));
        assert!(Scope::Global.applies_to(None));
        let dept = Scope::Group {
            kind: GroupKind::Department,
            target: "r&d".into(),
        };
        assert!(dept.applies_to(Some(&attrs)));
        assert!(!dept.applies_to(None));
        let role = Scope::Group {
            kind: GroupKind::Role,
            target: "manager".into(),
        };
        assert!(!role.applies_to(Some(&attrs)));
        let user = Scope::User {
            target: "EMP-1".into(),
        };
        assert!(user.applies_to(Some(&attrs)));
    }

    #[test]
    fn condition_kind_parses_aliases() {
        let kind: ConditionKind = serde_json::from_value(json!("risk-score")).unwrap();
        assert_eq!(kind, ConditionKind::RiskScore);
        let kind: ConditionKind = serde_json::from_value(json!("always_match")).unwrap();
        assert_eq!(kind, ConditionKind::Always);
        let kind: ConditionKind = serde_json::from_value(json!("department")).unwrap();
        assert_eq!(kind, ConditionKind::Attribute("department".into()));
        assert!(serde_json::from_value::<ConditionKind>(json!("")).is_err());
    }

    #[test]
    fn connector_defaults_to_and() {
        let draft: ConditionDraft =
            serde_json::from_value(json!({"type": "severity", "operator": "equals", "value": "high"}))
                .unwrap();
        assert_eq!(draft.connector, Connector::And);
        let draft: ConditionDraft = serde_json::from_value(
            json!({"type": "severity", "operator": "equals", "value": "high", "connector": "or"}),
        )
        .unwrap();
        assert_eq!(draft.connector, Connector::Or);
    }

    #[test]
    fn numeric_operator_requires_numeric_operand() {
        let draft = ConditionDraft {
            kind: ConditionKind::RiskScore,
            operator: Operator::GreaterThan,
            value: json!("high"),
            connector: Connector::And,
            position: None,
        };
        assert!(matches!(
            Condition::from_draft(draft, 0),
            Err(ValidationError::InvalidOperand { .. })
        ));
        let draft = ConditionDraft {
            kind: ConditionKind::Severity,
            operator: Operator::GreaterThan,
            value: json!("medium"),
            connector: Connector::And,
            position: None,
        };
        assert!(Condition::from_draft(draft, 0).is_ok());
    }

    #[test]
    fn in_operand_must_be_list() {
        let draft = ConditionDraft {
            kind: ConditionKind::Category,
            operator: Operator::In,
            value: json!({"a": 1}),
            connector: Connector::And,
            position: None,
        };
        assert!(Condition::from_draft(draft, 0).is_err());
    }

    #[test]
    fn always_condition_ignores_operand() {
        let draft = ConditionDraft {
            kind: ConditionKind::Always,
            operator: Operator::GreaterThan,
            value: Value::Null,
            connector: Connector::And,
            position: None,
        };
        assert!(Condition::from_draft(draft, 3).is_ok_and(|c| c.position == 3));
    }

    #[test]
    fn action_spec_parses_typed_config() {
        let spec: ActionSpec = serde_json::from_value(alert_json()).unwrap();
        assert_eq!(spec.action_type(), "alert");
        assert!(matches!(spec, ActionSpec::Alert(ref c) if c.recipients.len() == 1));
        assert_eq!(spec.config(), json!({"recipients": ["soc@example.com"]}));
    }

    #[test]
    fn action_spec_accepts_underscore_type() {
        let spec: ActionSpec = serde_json::from_value(
            json!({"type": "restrict_access", "config": {"resources": ["vpn"], "duration_secs": 3600}}),
        )
        .unwrap();
        assert_eq!(spec.action_type(), "restrict-access");
    }

    #[test]
    fn action_spec_rejects_incomplete_config() {
        assert!(serde_json::from_value::<ActionSpec>(json!({"type": "alert", "config": {"recipients": []}})).is_err());
        assert!(serde_json::from_value::<ActionSpec>(json!({"type": "escalate", "config": {}})).is_err());
        assert!(serde_json::from_value::<ActionSpec>(json!({"type": "", "config": {}})).is_err());
    }

    #[test]
    fn unknown_action_type_is_preserved() {
        let raw = json!({"type": "quarantine-device", "config": {"device": "laptop-7"}});
        let spec: ActionSpec = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(spec.action_type(), "quarantine-device");
        assert_eq!(serde_json::to_value(&spec).unwrap(), raw);
    }

    #[test]
    fn policy_from_draft_orders_children() {
        let draft: PolicyDraft = serde_json::from_value(json!({
            "name": "  Exfiltration  ",
            "scope": {"type": "global"},
            "priority": 10,
            "conditions": [
                {"type": "severity", "operator": "equals", "value": "high", "position": 5},
                {"type": "risk_score", "operator": "greater_than", "value": 80, "position": 1}
            ],
            "actions": [
                {"action": alert_json(), "execution_order": 2, "delay_secs": 600},
                {"action": alert_json(), "execution_order": 1}
            ]
        }))
        .unwrap();
        let policy = Policy::from_draft(draft, Utc::now()).unwrap();
        assert_eq!(policy.name, "Exfiltration");
        assert!(policy.active);
        assert_eq!(policy.conditions[0].kind, ConditionKind::RiskScore);
        assert_eq!(policy.actions[0].execution_order, 1);
        assert_eq!(policy.actions[1].delay(), chrono::Duration::minutes(10));
        assert_eq!(policy.next_condition_position(), 6);
        assert_eq!(policy.next_execution_order(), 3);
    }

    #[test]
    fn policy_from_draft_rejects_empty_name() {
        let draft = PolicyDraft {
            name: "   ".into(),
            description: None,
            scope: Scope::Global,
            priority: 0,
            active: true,
            conditions: vec![],
            actions: vec![],
        };
        assert_eq!(Policy::from_draft(draft, Utc::now()).unwrap_err(), ValidationError::EmptyName);
    }

    #[test]
    fn delay_upper_bound_enforced() {
        let draft = ActionDraft {
            action: serde_json::from_value(alert_json()).unwrap(),
            execution_order: None,
            delay_secs: MAX_ACTION_DELAY_SECS + 1,
            enabled: true,
        };
        assert!(matches!(
            Action::from_draft(draft, 0),
            Err(ValidationError::DelayTooLong { .. })
        ));
    }

    #[test]
    fn patch_updates_fields_and_timestamp() {
        let created = Utc::now() - chrono::Duration::hours(1);
        let draft = PolicyDraft {
            name: "p".into(),
            description: Some("d".into()),
            scope: Scope::Global,
            priority: 1,
            active: true,
            conditions: vec![],
            actions: vec![],
        };
        let policy = Policy::from_draft(draft, created).unwrap();
        let now = Utc::now();
        let patched = PolicyPatch {
            priority: Some(50),
            description: Some(String::new()),
            ..PolicyPatch::default()
        }
        .apply(&policy, now)
        .unwrap();
        assert_eq!(patched.priority, 50);
        assert!(patched.description.is_none());
        assert_eq!(patched.created_at, created);
        assert_eq!(patched.updated_at, now);
    }
}
