//! # Custom Extractors & Validation
//!
//! Provides the [`Validate`] trait for request bodies and helpers to extract
//! and validate JSON in handlers.

use axum::extract::rejection::JsonRejection;
use axum::Json;

use vigil_policy::model::PolicyDraft;
use vigil_policy::SecurityEvent;

use crate::error::AppError;

/// Upper bound on conditions or actions in one policy body.
pub const MAX_ITEMS_PER_POLICY: usize = 64;

/// Upper bound on producer attributes carried by one event.
pub const MAX_EVENT_ATTRIBUTES: usize = 256;

/// Business rules checked after deserialization.
pub trait Validate {
    /// Validate business rules. Returns an error message on failure.
    fn validate(&self) -> Result<(), String>;
}

/// Extract a JSON body.
///
/// Well-formed JSON that fails typed decoding (bad scope, unknown operator)
/// maps to [`AppError::Validation`]; anything else to [`AppError::BadRequest`].
pub fn extract_json<T>(result: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    result.map(|Json(v)| v).map_err(|err| match err {
        JsonRejection::JsonDataError(e) => AppError::Validation(e.body_text()),
        other => AppError::BadRequest(other.body_text()),
    })
}

/// Extract a JSON body and validate it using the [`Validate`] trait.
pub fn extract_validated_json<T: Validate>(
    result: Result<Json<T>, JsonRejection>,
) -> Result<T, AppError> {
    let value = extract_json(result)?;
    value.validate().map_err(AppError::Validation)?;
    Ok(value)
}

impl Validate for PolicyDraft {
    fn validate(&self) -> Result<(), String> {
        if self.conditions.len() > MAX_ITEMS_PER_POLICY {
            return Err(format!("a policy may carry at most {MAX_ITEMS_PER_POLICY} conditions"));
        }
        if self.actions.len() > MAX_ITEMS_PER_POLICY {
            return Err(format!("a policy may carry at most {MAX_ITEMS_PER_POLICY} actions"));
        }
        Ok(())
    }
}

impl Validate for SecurityEvent {
    fn validate(&self) -> Result<(), String> {
        if let Some(score) = self.risk_score {
            if !score.is_finite() {
                return Err("risk_score must be a finite number".to_string());
            }
        }
        if self.attributes.len() > MAX_EVENT_ATTRIBUTES {
            return Err(format!("events may carry at most {MAX_EVENT_ATTRIBUTES} attributes"));
        }
        Ok(())
    }
}
