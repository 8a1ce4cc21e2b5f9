//! `setup_commands` rule: run a sequence of allow-listed commands in the
//! session directory, each optionally gated by a condition check.

use std::collections::HashMap;
use std::time::Duration;

use crate::detector::ProjectType;
use crate::error::{Error, Result};
use crate::exec::ExecOptions;

use super::types::{AppliedChange, CommandSpec, SetupCommandsConfig};
use super::{RuleContext, RuleImpl};

pub struct SetupCommandsRule {
    config: SetupCommandsConfig,
}

impl SetupCommandsRule {
    #[must_use]
    pub fn new(config: SetupCommandsConfig) -> Self {
        Self { config }
    }

    /// `always | file_exists:<rel> | file_missing:<rel> | file_not_exists:<rel> | db_not_exists`.
    fn condition_met(condition: &str, ctx: &RuleContext<'_>) -> bool {
        if condition == "always" {
            return true;
        }
        if condition == "db_not_exists" {
            return Self::db_not_exists(ctx);
        }
        if let Some(rel) = condition.strip_prefix("file_exists:") {
            return ctx.session_root.join(rel).exists();
        }
        if let Some(rel) = condition.strip_prefix("file_missing:") {
            return !ctx.session_root.join(rel).exists();
        }
        if let Some(rel) = condition.strip_prefix("file_not_exists:") {
            return !ctx.session_root.join(rel).exists();
        }
        false
    }

    fn db_not_exists(ctx: &RuleContext<'_>) -> bool {
        match ctx.project_type {
            ProjectType::Rails => !ctx.session_root.join("storage/development.sqlite3").exists(),
            _ => false,
        }
    }
}

#[async_trait::async_trait]
impl RuleImpl for SetupCommandsRule {
    fn validate(&self) -> Result<()> {
        for command in &self.config.commands {
            if command.command.is_empty() {
                return Err(Error::Validation {
                    message: "setup_commands entry must declare a non-empty command".into(),
                });
            }
            if let Some(timeout) = command.timeout {
                if timeout > crate::exec::MAX_TIMEOUT_SECS {
                    return Err(Error::Validation {
                        message: format!(
                            "command timeout {timeout}s exceeds the {}s maximum",
                            crate::exec::MAX_TIMEOUT_SECS
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    async fn perform(&self, ctx: &RuleContext<'_>) -> Result<Vec<AppliedChange>> {
        let mut changes = Vec::new();
        let mut first_failure: Option<Error> = None;

        for command in &self.config.commands {
            if let Some(condition) = &command.condition {
                if !Self::condition_met(condition, ctx) {
                    continue;
                }
            }

            let opts = ExecOptions {
                working_directory: command.working_directory.as_ref().map(Into::into),
                env: command.env.clone(),
                timeout: command
                    .timeout
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(crate::exec::DEFAULT_TIMEOUT_SECS)),
                ..ExecOptions::default()
            };

            let result = ctx.executor.execute(&command.command, opts).await?;
            changes.push(AppliedChange::CommandExecuted {
                argv: command.command.clone(),
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                exit_code: result.exit_code,
            });

            if !result.success && command.required {
                let failure = Error::CommandFailed {
                    argv: command.command.clone(),
                    code: result.exit_code,
                    stdout: result.stdout,
                    stderr: result.stderr,
                };
                if !self.config.continue_on_failure {
                    return Err(failure);
                }
                if first_failure.is_none() {
                    first_failure = Some(failure);
                }
            }
        }

        // Every command still ran when `continue_on_failure` is set, but the
        // rule as a whole must still report its first required failure
        // rather than coming back `Applied`.
        if let Some(failure) = first_failure {
            return Err(failure);
        }

        Ok(changes)
    }

    fn rollback(&self, _ctx: &RuleContext<'_>, _changes: &[AppliedChange]) -> Result<()> {
        // Commands have no generic undo; recorded only for audit purposes.
        Ok(())
    }
}
