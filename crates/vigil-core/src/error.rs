//! # Error Hierarchy
//!
//! Foundational error types shared across the workspace.

use thiserror::Error;

/// Errors during canonical serialization.
#[derive(Error, Debug)]
pub enum CanonicalizationError {
    /// JSON serialization failed during canonicalization.
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Validation errors for identifier newtypes.
///
/// Each error carries the rejected input so that operators can diagnose
/// malformed producer payloads without guesswork.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Subject identifier is empty, too long, or contains control characters.
    #[error("invalid subject id: \"{0}\" (expected 1-256 printable characters)")]
    InvalidSubjectId(String),

    /// Event identifier is empty, too long, or contains control characters.
    #[error("invalid event id: \"{0}\" (expected 1-256 printable characters)")]
    InvalidEventId(String),

    /// A UUID-backed identifier failed to parse.
    #[error("invalid {kind} id: \"{value}\"")]
    InvalidUuid {
        /// Which identifier kind was being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },
}
