//! # Resolution Cache
//!
//! Per-subject cache of resolved policy ids, keyed by [`SubjectId`].
//!
//! Entries are immutable snapshots behind an `Arc`: invalidation removes
//! them, it never edits them. Each entry remembers the directory attributes
//! it was computed from so the [`CacheInvalidator`] can find every subject a
//! group-scoped mutation affects.
//!
//! A generation counter guards against a resolution that started before an
//! invalidation writing its now-stale result back afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use vigil_core::{PolicyId, SubjectId};

use crate::directory::SubjectAttributes;
use crate::model::{targets_match, Scope};

/// Cached resolution for one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Resolved policy ids in resolution order.
    pub policy_ids: Vec<PolicyId>,
    /// Directory attributes the resolution was computed from.
    pub attributes: SubjectAttributes,
    /// When the resolution was computed.
    pub computed_at: DateTime<Utc>,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Live entries.
    pub entries: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that required recomputation.
    pub misses: u64,
    /// Entries removed by invalidation.
    pub invalidated: u64,
}

/// Subject-keyed resolution cache.
#[derive(Debug)]
pub struct ResolutionCache {
    entries: DashMap<SubjectId, Arc<CacheEntry>>,
    ttl: chrono::Duration,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidated: AtomicU64,
}

impl ResolutionCache {
    /// Create an empty cache whose entries expire after `ttl`.
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
        }
    }

    /// Fresh entry for `subject`, if any. Expired entries are dropped.
    pub fn get(&self, subject: &SubjectId, now: DateTime<Utc>) -> Option<Arc<CacheEntry>> {
        let found = self.entries.get(subject).map(|e| Arc::clone(e.value()));
        match found {
            Some(entry) if now - entry.computed_at < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(entry) => {
                self.entries
                    .remove_if(subject, |_, current| Arc::ptr_eq(current, &entry));
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Current invalidation generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Store `entry` unless an invalidation happened since `generation`
    /// was read. Returns whether the entry was kept.
    pub fn insert_if_current(&self, subject: SubjectId, entry: CacheEntry, generation: u64) -> bool {
        if self.generation() != generation {
            return false;
        }
        let entry = Arc::new(entry);
        self.entries.insert(subject.clone(), Arc::clone(&entry));
        if self.generation() != generation {
            self.entries
                .remove_if(&subject, |_, current| Arc::ptr_eq(current, &entry));
            return false;
        }
        true
    }

    /// Remove one subject's entry.
    pub fn remove(&self, subject: &SubjectId) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let removed = self.entries.remove(subject).is_some();
        if removed {
            self.invalidated.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry for which `predicate` holds. Returns the count.
    pub fn remove_where(&self, predicate: impl Fn(&SubjectId, &CacheEntry) -> bool) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut removed = 0usize;
        self.entries.retain(|subject, entry| {
            let drop = predicate(subject, &**entry);
            if drop {
                removed += 1;
            }
            !drop
        });
        self.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Counters snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Invalidation
// ---------------------------------------------------------------------------

/// Maps a mutated policy's scope to the cache entries it may affect.
#[derive(Debug, Clone)]
pub struct CacheInvalidator {
    cache: Arc<ResolutionCache>,
}

impl CacheInvalidator {
    /// Invalidate entries of `cache`.
    pub fn new(cache: Arc<ResolutionCache>) -> Self {
        Self { cache }
    }

    /// Remove every entry a mutation under `scope` may have changed.
    ///
    /// Global drops everything, group drops subjects whose cached department
    /// or role matches, user drops the targeted subject.
    pub fn invalidate(&self, scope: &Scope) -> usize {
        let removed = match scope {
            Scope::Global => self.cache.remove_where(|_, _| true),
            Scope::Group { .. } => self
                .cache
                .remove_where(|_, entry| scope.applies_to(Some(&entry.attributes))),
            Scope::User { target } => self.cache.remove_where(|subject, entry| {
                targets_match(subject.as_str(), target) || scope.applies_to(Some(&entry.attributes))
            }),
        };
        tracing::debug!(%scope, removed, "resolution cache invalidated");
        removed
    }

    /// Drop one subject, e.g. after its directory attributes changed.
    pub fn invalidate_subject(&self, subject: &SubjectId) -> bool {
        self.cache.remove(subject)
    }
}
