//! # Policy Store
//!
//! Owns policies with their conditions and actions.
//!
//! Policies are held as immutable `Arc<Policy>` snapshots; a mutation clones
//! the current snapshot, applies the change, validates it and swaps it in.
//! Readers never observe a half-applied edit.
//!
//! Every successful mutation:
//!
//! 1. is appended to the [`Ledger`] with the acting principal and
//!    before/after values (if the append fails the mutation is not applied);
//! 2. is handed to the [`CacheInvalidator`] with the affected scope (both
//!    the old and the new scope when a scope changes).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use vigil_core::{ActionId, ConditionId, PolicyId};

use crate::cache::{CacheInvalidator, ResolutionCache};
use crate::directory::SubjectAttributes;
use crate::error::{PolicyError, ValidationError};
use crate::ledger::{Ledger, LedgerRecord};
use crate::model::{
    Action, ActionDraft, ActionPatch, Condition, ConditionDraft, Policy, PolicyDraft, PolicyPatch,
    Scope,
};

/// What the executor finds when it looks up a record's action at due time.
#[derive(Debug, Clone)]
pub enum DispatchTarget {
    /// Policy active and action enabled.
    Ready {
        /// Current policy snapshot.
        policy: Arc<Policy>,
        /// Current action.
        action: Action,
    },
    /// Policy deleted since scheduling.
    PolicyDeleted,
    /// Policy deactivated since scheduling.
    PolicyInactive,
    /// Action deleted since scheduling.
    ActionDeleted,
    /// Action disabled since scheduling.
    ActionDisabled,
}

impl DispatchTarget {
    /// Reason a record is skipped, if it must be.
    pub fn skip_reason(&self) -> Option<&'static str> {
        match self {
            Self::Ready { .. } => None,
            Self::PolicyDeleted => Some("policy deleted before dispatch"),
            Self::PolicyInactive => Some("policy disabled before dispatch"),
            Self::ActionDeleted => Some("action deleted before dispatch"),
            Self::ActionDisabled => Some("action disabled before dispatch"),
        }
    }
}

/// Authoritative policy storage.
#[derive(Debug)]
pub struct PolicyStore {
    policies: RwLock<BTreeMap<PolicyId, Arc<Policy>>>,
    referenced: RwLock<HashSet<PolicyId>>,
    ledger: Arc<Ledger>,
    invalidator: CacheInvalidator,
}

impl PolicyStore {
    /// Create an empty store auditing to `ledger` and invalidating `cache`.
    pub fn new(cache: Arc<ResolutionCache>, ledger: Arc<Ledger>) -> Self {
        Self {
            policies: RwLock::new(BTreeMap::new()),
            referenced: RwLock::new(HashSet::new()),
            ledger,
            invalidator: CacheInvalidator::new(cache),
        }
    }

    // -- Policy-level operations ------------------------------------------

    /// Validate and store a new policy.
    pub fn create_policy(&self, draft: PolicyDraft, actor: &str) -> Result<Arc<Policy>, PolicyError> {
        let policy = Arc::new(Policy::from_draft(draft, Utc::now())?);
        {
            let mut policies = self.policies.write();
            self.ledger.append(
                actor,
                LedgerRecord::Policy {
                    before: None,
                    after: Some(Box::new((*policy).clone())),
                },
            )?;
            policies.insert(policy.id, Arc::clone(&policy));
        }
        self.invalidator.invalidate(&policy.scope);
        tracing::info!(policy_id = %policy.id, scope = %policy.scope, actor, "policy created");
        Ok(policy)
    }

    /// Apply a partial update to a policy's own fields.
    ///
    /// A scope change is rejected once execution records reference the
    /// policy.
    pub fn update_policy(&self, id: PolicyId, patch: PolicyPatch, actor: &str) -> Result<Arc<Policy>, PolicyError> {
        let (before, after) = {
            let mut policies = self.policies.write();
            let current = policies
                .get(&id)
                .cloned()
                .ok_or_else(|| PolicyError::policy_not_found(id))?;
            if let Some(scope) = &patch.scope {
                if *scope != current.scope && self.is_referenced(id) {
                    return Err(ValidationError::ScopeLocked(id).into());
                }
            }
            let next = Arc::new(patch.apply(&current, Utc::now())?);
            self.ledger.append(
                actor,
                LedgerRecord::Policy {
                    before: Some(Box::new((*current).clone())),
                    after: Some(Box::new((*next).clone())),
                },
            )?;
            policies.insert(id, Arc::clone(&next));
            (current, next)
        };
        self.invalidate_scopes(&before.scope, &after.scope);
        tracing::info!(policy_id = %id, actor, "policy updated");
        Ok(after)
    }

    /// Delete a policy together with its conditions and actions.
    pub fn delete_policy(&self, id: PolicyId, actor: &str) -> Result<Arc<Policy>, PolicyError> {
        let removed = {
            let mut policies = self.policies.write();
            let current = policies
                .get(&id)
                .cloned()
                .ok_or_else(|| PolicyError::policy_not_found(id))?;
            self.ledger.append(
                actor,
                LedgerRecord::Policy {
                    before: Some(Box::new((*current).clone())),
                    after: None,
                },
            )?;
            policies.remove(&id);
            current
        };
        self.invalidator.invalidate(&removed.scope);
        tracing::info!(
            policy_id = %id,
            actor,
            conditions = removed.conditions.len(),
            actions = removed.actions.len(),
            "policy deleted"
        );
        Ok(removed)
    }

    /// Fetch one policy.
    pub fn get(&self, id: PolicyId) -> Option<Arc<Policy>> {
        self.policies.read().get(&id).cloned()
    }

    /// All policies, oldest first.
    pub fn list(&self) -> Vec<Arc<Policy>> {
        let mut all: Vec<Arc<Policy>> = self.policies.read().values().cloned().collect();
        all.sort_by_key(|p| (p.created_at, p.id));
        all
    }

    /// Active policies whose scope covers a subject with `attributes`.
    ///
    /// Without attributes only global policies qualify. Unordered.
    pub fn list_candidates(&self, attributes: Option<&SubjectAttributes>) -> Vec<Arc<Policy>> {
        self.policies
            .read()
            .values()
            .filter(|p| p.active && p.scope.applies_to(attributes))
            .cloned()
            .collect()
    }

    /// Number of stored policies.
    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }

    // -- Condition and action operations ----------------------------------

    /// Append a condition to a policy.
    pub fn add_condition(&self, policy_id: PolicyId, draft: ConditionDraft, actor: &str) -> Result<Condition, PolicyError> {
        self.mutate(policy_id, actor, |policy| {
            let condition = Condition::from_draft(draft, policy.next_condition_position())?;
            policy.conditions.push(condition.clone());
            let record = LedgerRecord::Condition {
                policy_id,
                before: None,
                after: Some(condition.clone()),
            };
            Ok((condition, record))
        })
    }

    /// Remove a condition from a policy.
    pub fn remove_condition(&self, policy_id: PolicyId, condition_id: ConditionId, actor: &str) -> Result<Condition, PolicyError> {
        self.mutate(policy_id, actor, |policy| {
            let index = policy
                .conditions
                .iter()
                .position(|c| c.id == condition_id)
                .ok_or_else(|| PolicyError::NotFound {
                    entity: "condition",
                    id: condition_id.to_string(),
                })?;
            let condition = policy.conditions.remove(index);
            let record = LedgerRecord::Condition {
                policy_id,
                before: Some(condition.clone()),
                after: None,
            };
            Ok((condition, record))
        })
    }

    /// Append an action to a policy.
    pub fn add_action(&self, policy_id: PolicyId, draft: ActionDraft, actor: &str) -> Result<Action, PolicyError> {
        self.mutate(policy_id, actor, |policy| {
            let action = Action::from_draft(draft, policy.next_execution_order())?;
            policy.actions.push(action.clone());
            let record = LedgerRecord::Action {
                policy_id,
                before: None,
                after: Some(action.clone()),
            };
            Ok((action, record))
        })
    }

    /// Change an action's configuration, order, delay or enabled flag.
    pub fn update_action(
        &self,
        policy_id: PolicyId,
        action_id: ActionId,
        patch: ActionPatch,
        actor: &str,
    ) -> Result<Action, PolicyError> {
        self.mutate(policy_id, actor, |policy| {
            let slot = policy
                .actions
                .iter_mut()
                .find(|a| a.id == action_id)
                .ok_or_else(|| action_not_found(action_id))?;
            let before = slot.clone();
            let after = before.patched(patch)?;
            *slot = after.clone();
            let record = LedgerRecord::Action {
                policy_id,
                before: Some(before),
                after: Some(after.clone()),
            };
            Ok((after, record))
        })
    }

    /// Remove an action from a policy.
    pub fn remove_action(&self, policy_id: PolicyId, action_id: ActionId, actor: &str) -> Result<Action, PolicyError> {
        self.mutate(policy_id, actor, |policy| {
            let index = policy
                .actions
                .iter()
                .position(|a| a.id == action_id)
                .ok_or_else(|| action_not_found(action_id))?;
            let action = policy.actions.remove(index);
            let record = LedgerRecord::Action {
                policy_id,
                before: Some(action.clone()),
                after: None,
            };
            Ok((action, record))
        })
    }

    fn mutate<T>(
        &self,
        policy_id: PolicyId,
        actor: &str,
        change: impl FnOnce(&mut Policy) -> Result<(T, LedgerRecord), PolicyError>,
    ) -> Result<T, PolicyError> {
        let (out, scope) = {
            let mut policies = self.policies.write();
            let current = policies
                .get(&policy_id)
                .ok_or_else(|| PolicyError::policy_not_found(policy_id))?;
            let mut next = (**current).clone();
            let (out, record) = change(&mut next)?;
            next.updated_at = Utc::now();
            next.normalize();
            self.ledger.append(actor, record)?;
            let scope = next.scope.clone();
            policies.insert(policy_id, Arc::new(next));
            (out, scope)
        };
        self.invalidator.invalidate(&scope);
        tracing::info!(policy_id = %policy_id, actor, "policy children updated");
        Ok(out)
    }

    fn invalidate_scopes(&self, before: &Scope, after: &Scope) {
        self.invalidator.invalidate(before);
        if before != after {
            self.invalidator.invalidate(after);
        }
    }

    // -- Execution support ------------------------------------------------

    /// Record that execution records reference these policies, locking
    /// their scope.
    pub fn mark_referenced(&self, ids: impl IntoIterator<Item = PolicyId>) {
        self.referenced.write().extend(ids);
    }

    /// Whether execution records reference the policy.
    pub fn is_referenced(&self, id: PolicyId) -> bool {
        self.referenced.read().contains(&id)
    }

    /// Current state of a scheduled action, checked at dispatch time.
    pub fn dispatch_target(&self, policy_id: PolicyId, action_id: ActionId) -> DispatchTarget {
        let Some(policy) = self.get(policy_id) else {
            return DispatchTarget::PolicyDeleted;
        };
        if !policy.active {
            return DispatchTarget::PolicyInactive;
        }
        match policy.action(action_id) {
            None => DispatchTarget::ActionDeleted,
            Some(action) if !action.enabled => DispatchTarget::ActionDisabled,
            Some(action) => {
                let action = action.clone();
                DispatchTarget::Ready { policy, action }
            }
        }
    }

    /// Load previously persisted policies without auditing or invalidating.
    pub fn restore(&self, policies: impl IntoIterator<Item = Policy>) {
        let mut map = self.policies.write();
        for mut policy in policies {
            policy.normalize();
            map.insert(policy.id, Arc::new(policy));
        }
    }
}

fn action_not_found(id: ActionId) -> PolicyError {
    PolicyError::NotFound {
        entity: "action",
        id: id.to_string(),
    }
}
