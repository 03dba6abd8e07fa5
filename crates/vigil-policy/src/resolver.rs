//! # Resolver
//!
//! Computes the ordered set of active policies applicable to a subject:
//! every global policy, every group policy whose target matches the
//! subject's department or role, and every user policy targeting the
//! subject's identifier. Highest priority first; ties go to the most
//! recently created policy, then to the lower id so the order is total.
//!
//! Resolutions are served from the [`ResolutionCache`] when a fresh entry
//! exists. A cache entry naming a policy that is gone or inactive is a
//! [`CacheInconsistency`]: the entry is dropped and the subject recomputed.
//!
//! Directory failure fails closed. Group and user policies are treated as
//! non-matching, global policies still apply, and the degraded result is
//! not cached.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use vigil_core::SubjectId;

use crate::cache::{CacheEntry, ResolutionCache};
use crate::directory::{DirectoryError, DirectoryLookup, SubjectAttributes};
use crate::error::{CacheInconsistency, ResolutionError};
use crate::model::Policy;
use crate::store::PolicyStore;

/// Where a resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Fresh cache entry.
    Cache,
    /// Recomputed from the policy store.
    Computed,
    /// Directory lookup failed; global policies only.
    FailClosed,
}

impl ResolutionSource {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Computed => "computed",
            Self::FailClosed => "fail_closed",
        }
    }
}

impl std::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered applicable policies for one subject.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Subject resolved.
    pub subject_id: SubjectId,
    /// Directory attributes used, absent when the lookup failed.
    pub attributes: Option<SubjectAttributes>,
    /// Applicable active policies in resolution order.
    pub policies: Vec<Arc<Policy>>,
    /// Where the result came from.
    pub source: ResolutionSource,
}

/// Sort into resolution order: priority descending, creation time
/// descending, id ascending.
pub fn order_policies(policies: &mut [Arc<Policy>]) {
    policies.sort_by_key(|p| (Reverse(p.priority), Reverse(p.created_at), p.id));
}

/// Cache-backed policy resolution.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<PolicyStore>,
    cache: Arc<ResolutionCache>,
    directory: Arc<dyn DirectoryLookup>,
    lookup_timeout: Duration,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("lookup_timeout", &self.lookup_timeout)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Resolver over `store`, memoizing into `cache`.
    pub fn new(
        store: Arc<PolicyStore>,
        cache: Arc<ResolutionCache>,
        directory: Arc<dyn DirectoryLookup>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            directory,
            lookup_timeout,
        }
    }

    /// Resolve the policies applicable to `subject` at `now`.
    ///
    /// Never fails: directory trouble degrades to global-only.
    pub async fn resolve(&self, subject: &SubjectId, now: DateTime<Utc>) -> Resolution {
        if let Some(entry) = self.cache.get(subject, now) {
            match self.from_cache(subject, &entry) {
                Ok(policies) => {
                    return Resolution {
                        subject_id: subject.clone(),
                        attributes: Some(entry.attributes.clone()),
                        policies,
                        source: ResolutionSource::Cache,
                    };
                }
                Err(inconsistency) => {
                    tracing::warn!(%inconsistency, "dropping inconsistent resolution cache entry");
                    self.cache.remove(subject);
                }
            }
        }

        let generation = self.cache.generation();
        match self.lookup(subject).await {
            Ok(attributes) => {
                let policies = self.compute(Some(&attributes));
                let entry = CacheEntry {
                    policy_ids: policies.iter().map(|p| p.id).collect(),
                    attributes: attributes.clone(),
                    computed_at: now,
                };
                let cached = self.cache.insert_if_current(subject.clone(), entry, generation);
                tracing::debug!(
                    subject = %subject,
                    policies = policies.len(),
                    cached,
                    "policies resolved"
                );
                Resolution {
                    subject_id: subject.clone(),
                    attributes: Some(attributes),
                    policies,
                    source: ResolutionSource::Computed,
                }
            }
            Err(source) => {
                let error = ResolutionError::Directory {
                    subject: subject.clone(),
                    source,
                };
                tracing::warn!(%error, "resolving global policies only");
                Resolution {
                    subject_id: subject.clone(),
                    attributes: None,
                    policies: self.compute(None),
                    source: ResolutionSource::FailClosed,
                }
            }
        }
    }

    /// Recompute from the store without touching the cache or directory.
    pub fn compute(&self, attributes: Option<&SubjectAttributes>) -> Vec<Arc<Policy>> {
        let mut policies = self.store.list_candidates(attributes);
        order_policies(&mut policies);
        policies
    }

    fn from_cache(&self, subject: &SubjectId, entry: &CacheEntry) -> Result<Vec<Arc<Policy>>, CacheInconsistency> {
        entry
            .policy_ids
            .iter()
            .map(|id| match self.store.get(*id) {
                Some(policy) if policy.active => Ok(policy),
                _ => Err(CacheInconsistency {
                    subject: subject.clone(),
                    policy_id: *id,
                }),
            })
            .collect()
    }

    async fn lookup(&self, subject: &SubjectId) -> Result<SubjectAttributes, DirectoryError> {
        match tokio::time::timeout(self.lookup_timeout, self.directory.lookup(subject)).await {
            Ok(result) => result,
            Err(_) => Err(DirectoryError::Unavailable(format!(
                "lookup timed out after {}ms",
                self.lookup_timeout.as_millis()
            ))),
        }
    }
}
