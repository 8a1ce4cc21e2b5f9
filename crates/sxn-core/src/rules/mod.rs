//! Rule graph validation, scheduling, execution and rollback.
//!
//! A rule is a small trait object (`validate`, `perform`, `rollback`) keyed
//! by the `type:` tag in its serialized configuration; see `types.rs` for the
//! configuration schema and `engine.rs` for the scheduler.

pub mod copy_files;
pub mod engine;
pub mod graph;
pub mod setup_commands;
pub mod template_rule;
pub mod types;

use std::path::Path;

use crate::copier::FileCopier;
use crate::detector::ProjectType;
use crate::error::Result;
use crate::exec::CommandExecutor;
use crate::template::VariableNamespace;
use types::AppliedChange;

/// Shared read-only collaborators every rule needs to perform or roll back.
pub struct RuleContext<'a> {
    /// Where rule destinations are validated and written: the session's
    /// per-project worktree directory.
    pub session_root: &'a Path,
    /// Where rule `source` fields are resolved and validated from: the
    /// project's registered, read-only checkout.
    pub source_root: &'a Path,
    pub executor: &'a CommandExecutor,
    pub copier: &'a FileCopier,
    pub master_key: Option<[u8; 32]>,
    pub session_salt: Vec<u8>,
    pub namespace: &'a VariableNamespace,
    pub project_type: ProjectType,
}

/// A rule's capability set: validate its own config, perform its effect,
/// undo a prior `perform` given the change log it produced.
#[async_trait::async_trait]
pub trait RuleImpl: Send + Sync {
    fn validate(&self) -> Result<()>;
    async fn perform(&self, ctx: &RuleContext<'_>) -> Result<Vec<AppliedChange>>;
    fn rollback(&self, ctx: &RuleContext<'_>, changes: &[AppliedChange]) -> Result<()>;
}

/// Construct the trait-object rule for one configuration entry.
#[must_use]
pub fn build_rule(config: &types::RuleConfig) -> Box<dyn RuleImpl> {
    match config {
        types::RuleConfig::CopyFiles { files } => {
            Box::new(copy_files::CopyFilesRule::new(files.clone()))
        }
        types::RuleConfig::SetupCommands(config) => {
            Box::new(setup_commands::SetupCommandsRule::new(config.clone()))
        }
        types::RuleConfig::Template(config) => {
            Box::new(template_rule::TemplateRule::new(config.clone()))
        }
    }
}
