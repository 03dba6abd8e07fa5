//! # Authentication & Authorization Middleware
//!
//! Bearer token middleware with role-based access control.
//!
//! ## Token Format
//!
//! ```text
//! Bearer {role}:{principal}:{secret}   # role-scoped, principal may be empty
//! Bearer {secret}                      # legacy format (treated as Admin)
//! ```
//!
//! The principal becomes the actor recorded in the audit ledger for every
//! mutation the request performs.

use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::ToSchema;

use crate::error::{AppError, ErrorBody, ErrorDetail};

// ── Role ────────────────────────────────────────────────────────────────────

/// Roles ordered by privilege: `Analyst < Operator < Admin`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Reads resolutions, executions and the audit ledger.
    Analyst,
    /// Submits events and retries failed executions.
    Operator,
    /// Administers policies, conditions and actions.
    Admin,
}

impl Role {
    /// Return the string representation of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::Operator => "operator",
            Self::Admin => "admin",
        }
    }
}

// ── CallerIdentity ──────────────────────────────────────────────────────────

/// Identity of the authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// The caller's role.
    pub role: Role,
    /// Named principal, when the token carries one.
    pub principal: Option<String>,
}

impl CallerIdentity {
    /// Identity injected when authentication is disabled.
    pub fn anonymous_admin() -> Self {
        Self {
            role: Role::Admin,
            principal: None,
        }
    }

    /// Check if the caller has at least the given minimum role.
    pub fn has_role(&self, minimum: Role) -> bool {
        self.role >= minimum
    }

    /// Actor name recorded in the audit ledger.
    pub fn actor(&self) -> String {
        match &self.principal {
            Some(principal) => principal.clone(),
            None => self.role.as_str().to_string(),
        }
    }
}

#[axum::async_trait]
impl<S: Send + Sync> axum::extract::FromRequestParts<S> for CallerIdentity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CallerIdentity>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("no caller identity in request context".into()))
    }
}

/// Check that the caller has at least the required role.
pub fn require_role(caller: &CallerIdentity, minimum: Role) -> Result<(), AppError> {
    if caller.has_role(minimum) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "role '{}' required, caller has '{}'",
            minimum.as_str(),
            caller.role.as_str()
        )))
    }
}

// ── Auth Configuration ──────────────────────────────────────────────────────

/// Auth configuration injected into request extensions.
#[derive(Clone)]
pub struct AuthConfig {
    /// Expected shared secret; `None` disables authentication.
    pub token: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

// ── Token Validation ────────────────────────────────────────────────────────

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "operator" => Ok(Self::Operator),
            "analyst" => Ok(Self::Analyst),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

fn secret_matches(provided: &str, expected: &str) -> bool {
    let (provided, expected) = (provided.as_bytes(), expected.as_bytes());
    if provided.len() != expected.len() {
        // Keep the comparison cost independent of where lengths diverge.
        let _ = expected.ct_eq(expected);
        return false;
    }
    provided.ct_eq(expected).into()
}

/// Parse a bearer token in format `{role}:{principal}:{secret}` or `{secret}`.
///
/// The secret is checked before the role so that a bad secret never reveals
/// which role names exist.
pub fn parse_bearer_token(provided: &str, expected_secret: &str) -> Result<CallerIdentity, String> {
    let (role, principal, secret) = match provided.splitn(3, ':').collect::<Vec<_>>()[..] {
        [secret] => (None, "", secret),
        [role, principal, secret] => (Some(role), principal.trim(), secret),
        _ => {
            return Err(
                "invalid token format, expected {role}:{principal}:{secret} or {secret}".into(),
            )
        }
    };
    if !secret_matches(secret, expected_secret) {
        return Err("invalid bearer token".into());
    }
    let Some(role) = role else {
        return Ok(CallerIdentity::anonymous_admin());
    };
    let role: Role = role.parse()?;
    if principal.chars().any(char::is_control) {
        return Err("principal must not contain control characters".into());
    }
    Ok(CallerIdentity {
        role,
        principal: (!principal.is_empty()).then(|| principal.to_string()),
    })
}

/// Resolve the caller from the `Authorization` header.
fn authenticate(headers: &HeaderMap, expected_secret: &str) -> Result<CallerIdentity, String> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or("missing authorization header")?
        .to_str()
        .map_err(|_| "authorization header is not valid ASCII")?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or("authorization header must use Bearer scheme")?;
    parse_bearer_token(token, expected_secret)
}

// ── Middleware ───────────────────────────────────────────────────────────────

/// Validate the bearer token and inject a [`CallerIdentity`].
///
/// When `AuthConfig.token` is `None`, every request runs as an anonymous
/// admin (development mode).
pub async fn auth_middleware(mut request: Request, next: Next) -> Response {
    let expected = request
        .extensions()
        .get::<AuthConfig>()
        .and_then(|config| config.token.clone());

    let identity = match expected {
        None => CallerIdentity::anonymous_admin(),
        Some(expected) => match authenticate(request.headers(), &expected) {
            Ok(identity) => identity,
            Err(reason) => {
                tracing::warn!(%reason, "authentication failed");
                return unauthorized_response(&reason);
            }
        },
    };
    request.extensions_mut().insert(identity);
    next.run(request).await
}

fn unauthorized_response(message: &str) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            code: "UNAUTHORIZED".to_string(),
            message: message.to_string(),
            details: None,
        },
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}
