//! Rule configuration schema and run-time state, mirrored from the external
//! YAML/JSON contract in the engine's external-interface documentation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::copier::CopyOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Pending,
    Running,
    Applied,
    Failed,
    RolledBack,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategySpec {
    Copy,
    Symlink,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CopyFileSpec {
    pub source: String,
    pub destination: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    pub permissions: Option<String>,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default = "default_true")]
    pub required: bool,
}

impl CopyFileSpec {
    #[must_use]
    pub fn strategy(&self) -> CopyStrategySpec {
        match self.strategy.as_deref() {
            Some("symlink") => CopyStrategySpec::Symlink,
            _ => CopyStrategySpec::Copy,
        }
    }

    #[must_use]
    pub fn destination_path(&self) -> &str {
        self.destination.as_deref().unwrap_or(&self.source)
    }

    pub fn mode(&self) -> crate::error::Result<Option<u32>> {
        self.permissions
            .as_deref()
            .map(|p| {
                u32::from_str_radix(p, 8).map_err(|_| crate::error::Error::Validation {
                    message: format!("invalid octal permissions string '{p}'"),
                })
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandSpec {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub timeout: Option<u64>,
    pub condition: Option<String>,
    pub working_directory: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SetupCommandsConfig {
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub continue_on_failure: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplateSpec {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplateConfig {
    pub templates: Vec<TemplateSpec>,
}

fn default_true() -> bool {
    true
}

/// Tagged sum type for the three rule kinds; the `type:` field in the
/// serialized form drives the match at deserialization time.
#[derive(Debug, Clone)]
pub enum RuleConfig {
    CopyFiles { files: Vec<CopyFileSpec> },
    SetupCommands(SetupCommandsConfig),
    Template(TemplateConfig),
}

impl RuleConfig {
    /// Only `setup_commands` rules carry this knob; other rule kinds always
    /// fail their batch on an unrecoverable error.
    #[must_use]
    pub fn continue_on_failure(&self) -> bool {
        match self {
            Self::SetupCommands(config) => config.continue_on_failure,
            Self::CopyFiles { .. } | Self::Template(_) => false,
        }
    }
}

/// One entry of the `rules:` map: a name, its config, and its declared
/// dependency names.
#[derive(Debug, Clone)]
pub struct RuleDefinition {
    pub name: String,
    pub config: RuleConfig,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    FileCreated,
    FileCopied,
    SymlinkCreated,
    CommandExecuted,
    TemplateRendered,
}

/// Enough information to undo one effect of a rule. Owned by the rule until
/// the batch either commits successfully or rolls back.
#[derive(Debug, Clone)]
pub enum AppliedChange {
    Copy(CopyOutcome),
    TemplateWrite {
        destination: PathBuf,
        prior_content: Option<Vec<u8>>,
    },
    CommandExecuted {
        argv: Vec<String>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_code: Option<i32>,
    },
}

impl AppliedChange {
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Copy(outcome) => match outcome.strategy {
                crate::copier::CopyStrategy::Copy => ChangeKind::FileCopied,
                crate::copier::CopyStrategy::Symlink => ChangeKind::SymlinkCreated,
            },
            Self::TemplateWrite { .. } => ChangeKind::TemplateRendered,
            Self::CommandExecuted { .. } => ChangeKind::CommandExecuted,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleOutcome {
    pub state: RuleState,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub error: Option<String>,
    pub changes: Vec<AppliedChange>,
}

impl Default for RuleState {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub applied: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub total_wall_time: Duration,
    pub rule_outcomes: std::collections::BTreeMap<String, RuleOutcome>,
}

impl ExecutionResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }
}
