//! # vigil-cli: Offline Tooling for Policy Bundles
//!
//! A policy bundle is a YAML (or JSON) document holding policy definitions
//! and, optionally, a static directory of subjects:
//!
//! ```yaml
//! policies:
//!   - name: High risk engineer
//!     scope: { type: group, kind: department, target: engineering }
//!     priority: 80
//!     conditions:
//!       - { type: risk_score, operator: greater_than, value: 85 }
//!     actions:
//!       - action: { type: alert, config: { recipients: [soc@example.com] } }
//! directory:
//!   - { subject_id: emp-1, department: engineering, role: developer }
//! ```
//!
//! ## Subcommands
//!
//! - `validate`: Check every policy in a bundle and report each failure
//! - `resolve`: Print the ordered effective policies for a subject
//! - `simulate`: Evaluate an event against the bundle without side effects
//!
//! Handlers build an in-memory engine from the bundle; nothing is persisted
//! and no actions are dispatched.

pub mod bundle;
pub mod resolve;
pub mod simulate;
pub mod validate;
