//! # Identity Newtypes
//!
//! Identifier newtypes for every entity the engine tracks. Each identifier is
//! a distinct type; you cannot pass a [`ConditionId`] where an [`ActionId`]
//! is expected.
//!
//! ## Validation
//!
//! UUID-based identifiers ([`PolicyId`], [`ConditionId`], [`ActionId`],
//! [`ExecutionId`]) are minted by the engine and always valid by
//! construction. String-based identifiers ([`SubjectId`], [`EventId`]) come
//! from external producers (directory, detection feeds) and are validated at
//! construction time.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Maximum length accepted for externally supplied identifiers.
const MAX_EXTERNAL_ID_LEN: usize = 256;

// ---------------------------------------------------------------------------
// UUID-based identifiers (always valid by construction)
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Access the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| ValidationError::InvalidUuid {
                        kind: $kind,
                        value: s.to_string(),
                    })
            }
        }
    };
}

uuid_id!(
    /// Identifier of a policy held by the Policy Store.
    PolicyId,
    "policy"
);

uuid_id!(
    /// Identifier of a condition owned by a policy.
    ConditionId,
    "condition"
);

uuid_id!(
    /// Identifier of an action owned by a policy.
    ActionId,
    "action"
);

uuid_id!(
    /// Identifier of an execution record.
    ExecutionId,
    "execution"
);

// ---------------------------------------------------------------------------
// String-based identifiers (validated at construction)
// ---------------------------------------------------------------------------

fn is_valid_external_id(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_EXTERNAL_ID_LEN && !s.chars().any(char::is_control)
}

/// Identifier of a monitored subject (employee, contractor, service account).
///
/// Supplied by event producers and resolved against the directory. Must be
/// 1-256 characters with no control characters; surrounding whitespace is
/// trimmed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
    /// Validate and wrap a subject identifier.
    pub fn new(s: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = s.into();
        let trimmed = raw.trim();
        if !is_valid_external_id(trimmed) {
            return Err(ValidationError::InvalidSubjectId(raw));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Access the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubjectId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SubjectId> for String {
    fn from(id: SubjectId) -> Self {
        id.0
    }
}

impl FromStr for SubjectId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an incoming security/compliance event.
///
/// Producers assign event ids; when absent the engine mints a UUID-based one
/// via [`EventId::generate`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

impl EventId {
    /// Validate and wrap an event identifier.
    pub fn new(s: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = s.into();
        let trimmed = raw.trim();
        if !is_valid_external_id(trimmed) {
            return Err(ValidationError::InvalidEventId(raw));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Mint a fresh event identifier.
    pub fn generate() -> Self {
        Self(format!("evt-{}", Uuid::new_v4()))
    }

    /// Access the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.0
    }
}

impl FromStr for EventId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
