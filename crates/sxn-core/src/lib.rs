//! # sxn-core
//!
//! Session engine for materializing workstation sessions: one or more git
//! worktrees, seeded with project secrets and bootstrapped by a declarative,
//! dependency-ordered rule set.
//!
//! ## Laws
//!
//! - No `unwrap()`/`expect()` outside tests — every fallible path returns
//!   [`error::Result`].
//! - No `unsafe`.
//! - No shell interpolation — commands run through [`exec::CommandExecutor`]
//!   against an explicit argv, never a shell string.
//!
//! ## Modules
//!
//! - [`store`] — the session metadata database (SQLite via `sqlx`).
//! - [`rules`] — the rule schema, DAG scheduler, and per-rule-kind execution.
//! - [`detector`] — project-type detection and default rule suggestions.
//! - [`orchestrator`] — composes store, worktrees, and rules into one session
//!   lifecycle.
//! - [`path_validator`], [`exec`], [`copier`], [`template`], [`lock`] — the
//!   sandboxing primitives the rule implementations are built on.

pub mod config;
pub mod copier;
pub mod detector;
pub mod error;
pub mod exec;
pub mod identifiers;
pub mod lock;
pub mod orchestrator;
pub mod path_validator;
pub mod rules;
pub mod store;
pub mod template;

pub use config::{EngineConfig, RecoveryPolicy};
pub use error::{Error, ErrorKind, Result};
pub use identifiers::{Name, SessionId};
pub use orchestrator::{ProjectRegistration, SessionOrchestrator};
pub use store::session::{SessionRecord, SessionStatus};
pub use store::SessionStore;
