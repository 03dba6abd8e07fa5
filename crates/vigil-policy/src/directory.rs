//! # Directory Lookup
//!
//! The resolver learns a subject's department, role and identifier from an
//! external directory. The directory is a seam: production deployments plug
//! an HTTP client in behind [`DirectoryLookup`], tests and the CLI use
//! [`StaticDirectory`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vigil_core::SubjectId;

/// Organizational attributes of a monitored subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectAttributes {
    /// Identifier targeted by user-scoped policies.
    pub identifier: String,
    /// Department the subject belongs to.
    #[serde(default)]
    pub department: Option<String>,
    /// Role the subject holds.
    #[serde(default)]
    pub role: Option<String>,
}

impl SubjectAttributes {
    /// Attributes carrying only an identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            department: None,
            role: None,
        }
    }

    /// Set the department.
    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    /// Set the role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Directory lookup failure.
#[derive(Error, Debug, Clone)]
pub enum DirectoryError {
    /// The directory has no record of the subject.
    #[error("subject {0} not found in directory")]
    NotFound(SubjectId),

    /// The directory could not be reached or answered with an error.
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Source of subject attributes.
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    /// Look up the attributes of `subject`.
    async fn lookup(&self, subject: &SubjectId) -> Result<SubjectAttributes, DirectoryError>;
}

/// In-memory directory backed by a map.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: RwLock<HashMap<SubjectId, SubjectAttributes>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory pre-populated with `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = (SubjectId, SubjectAttributes)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Insert or replace a subject's attributes.
    pub fn insert(&self, subject: SubjectId, attributes: SubjectAttributes) {
        self.entries.write().insert(subject, attributes);
    }

    /// Remove a subject.
    pub fn remove(&self, subject: &SubjectId) -> Option<SubjectAttributes> {
        self.entries.write().remove(subject)
    }

    /// Number of known subjects.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl DirectoryLookup for StaticDirectory {
    async fn lookup(&self, subject: &SubjectId) -> Result<SubjectAttributes, DirectoryError> {
        self.entries
            .read()
            .get(subject)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(subject.clone()))
    }
}
