//! # vigil-policy: Policy Resolution & Execution Engine
//!
//! Decides, for any monitored subject and any incoming security/compliance
//! event, which organizational policies apply, whether their trigger
//! conditions hold, and which remediation actions must run, in what order,
//! with what delay, and with auditable outcomes.
//!
//! ## Pipeline
//!
//! ```text
//! event ─► Resolver (cache-backed) ─► ConditionEvaluator ─► ActionScheduler
//!                                                              │ persist
//!                                                              ▼
//!                    Ledger ◄── Executor (worker pool) ◄── ExecutionStore
//! ```
//!
//! - [`store::PolicyStore`] owns policies, conditions and actions. Every
//!   successful mutation is appended to the [`ledger::Ledger`] and passed to
//!   the [`cache::CacheInvalidator`].
//! - [`resolver::Resolver`] unions global, group and user-scoped policies and
//!   orders them by descending priority, then descending creation time.
//! - [`evaluation::ConditionEvaluator`] filters resolved policies against the
//!   event's attributes, left-to-right over declared connectors.
//! - [`scheduler::ActionScheduler`] creates one pending
//!   [`scheduler::ExecutionRecord`] per enabled action and persists it before
//!   acknowledging.
//! - [`executor::Executor`] claims due records, dispatches them to
//!   [`handlers::ActionHandler`]s under a bounded execution horizon, and
//!   records terminal outcomes.

pub mod cache;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod executor;
pub mod handlers;
pub mod journal;
pub mod ledger;
pub mod model;
pub mod resolver;
pub mod scheduler;
pub mod store;

// Re-export primary types.
pub use cache::{CacheInvalidator, ResolutionCache};
pub use config::EngineConfig;
pub use directory::{DirectoryLookup, StaticDirectory, SubjectAttributes};
pub use engine::{EvaluationOutcome, PolicyEngine, Preview};
pub use error::{PolicyError, ValidationError};
pub use evaluation::{ConditionEvaluator, SecurityEvent};
pub use executor::{Executor, TickSummary};
pub use handlers::{ActionDispatch, ActionHandler, HandlerRegistry, TracingHandler};
pub use journal::{ExecutionStore, MemoryExecutionStore};
pub use ledger::{Ledger, LedgerEntry};
pub use model::{Action, ActionSpec, Condition, ConditionKind, Policy, PolicyDraft, Scope};
pub use resolver::{Resolution, ResolutionSource, Resolver};
pub use scheduler::{ActionScheduler, ExecutionRecord, ExecutionStatus};
pub use store::PolicyStore;
