#![deny(missing_docs)]

//! # vigil-core: Foundational Types for the vigil Policy Engine
//!
//! Every other crate in the workspace depends on this one. It has no internal
//! crate dependencies.
//!
//! ## Design Principles
//!
//! 1. **Newtype wrappers for identifiers.** A [`PolicyId`] cannot be passed
//!    where an [`ActionId`] is expected, and subject/event identifiers coming
//!    from external producers are validated once, at the boundary.
//!
//! 2. **[`CanonicalBytes`] is the sole path to digest computation.** Ledger
//!    hash chains are computed over canonical JSON (sorted keys, compact
//!    separators) so that the same entry always yields the same digest.
//!
//! 3. **Structured errors with `thiserror`.** No `Box<dyn Error>`, no
//!    `.unwrap()` outside tests.

pub mod canonical;
pub mod digest;
pub mod error;
pub mod identity;

pub use canonical::CanonicalBytes;
pub use digest::{sha256_digest, ContentDigest};
pub use error::{CanonicalizationError, ValidationError};
pub use identity::{ActionId, ConditionId, EventId, ExecutionId, PolicyId, SubjectId};
