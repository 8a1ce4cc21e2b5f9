//! Ambient configuration: `SXN_*` environment variable overrides layered over
//! struct defaults. Hierarchical file-discovery and YAML parsing are handled
//! by the embedding CLI, not here — this is just the engine's own knobs.

use std::str::FromStr;

use crate::error::{Error, Result};

/// Governs what happens when the store's pre-flight integrity check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    Silent,
    Warn,
    #[default]
    FailFast,
}

impl FromStr for RecoveryPolicy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Ok(Self::Silent),
            "warn" => Ok(Self::Warn),
            "fail_fast" | "failfast" => Ok(Self::FailFast),
            other => Err(Error::Validation {
                message: format!("unknown recovery policy '{other}'"),
            }),
        }
    }
}

fn parse_bool_env(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sessions_folder: std::path::PathBuf,
    pub max_sessions: Option<u32>,
    pub recovery_policy: RecoveryPolicy,
    pub agent_id: Option<String>,
    pub allowed_commands: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sessions_folder: std::env::temp_dir().join("sxn-sessions"),
            max_sessions: None,
            recovery_policy: RecoveryPolicy::default(),
            agent_id: None,
            allowed_commands: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Layer `SXN_*` environment variables over the struct defaults. Explicit
    /// arguments passed by the embedding binary should be applied after this
    /// (env vars are overridden only by explicit arguments, per the contract).
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(folder) = std::env::var("SXN_SESSIONS_FOLDER") {
            config.sessions_folder = folder.into();
        }
        if let Ok(raw) = std::env::var("SXN_MAX_SESSIONS") {
            if let Ok(n) = raw.parse() {
                config.max_sessions = Some(n);
            }
        }
        if let Ok(raw) = std::env::var("SXN_RECOVERY_POLICY") {
            if let Ok(policy) = raw.parse() {
                config.recovery_policy = policy;
            }
        }
        if let Ok(raw) = std::env::var("SXN_STRICT") {
            if parse_bool_env(&raw) == Some(true) {
                config.recovery_policy = RecoveryPolicy::FailFast;
            }
        }
        if let Ok(id) = std::env::var("SXN_AGENT_ID") {
            config.agent_id = Some(id);
        }
        if let Ok(raw) = std::env::var("SXN_ALLOWED_COMMANDS") {
            config.allowed_commands = raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }

        config
    }
}
