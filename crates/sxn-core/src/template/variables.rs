//! Builds the fixed seven-way variable namespace templates render against.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::exec::{CommandExecutor, ExecOptions};
use crate::store::session::SessionRecord;

const ENV_WHITELIST_PREFIX: &str = "SXN_TPL_";

/// `session`, `project`, `git`, `user`, `environment`, `timestamp`, `custom`.
/// Unknown top-level names evaluate to empty at render time (handled by the
/// template engine's `undefined_behavior`, not here).
#[derive(Debug, Clone, serde::Serialize)]
pub struct VariableNamespace {
    pub session: Value,
    pub project: Value,
    pub git: Value,
    pub user: Value,
    pub environment: Value,
    pub timestamp: Value,
    pub custom: Value,
}

impl VariableNamespace {
    #[must_use]
    pub fn builder() -> VariableNamespaceBuilder {
        VariableNamespaceBuilder::default()
    }
}

#[derive(Default)]
pub struct VariableNamespaceBuilder {
    session: Option<Value>,
    project: Option<Value>,
    custom: HashMap<String, Value>,
}

impl VariableNamespaceBuilder {
    #[must_use]
    pub fn session(mut self, record: &SessionRecord) -> Self {
        self.session = Some(serde_json::json!({
            "id": record.id.as_str(),
            "name": record.name.as_str(),
            "status": record.status.to_string(),
            "created_at": record.created_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        }));
        self
    }

    #[must_use]
    pub fn project(mut self, name: &str, path: &str, project_type: &str) -> Self {
        self.project = Some(serde_json::json!({
            "name": name,
            "path": path,
            "type": project_type,
        }));
        self
    }

    #[must_use]
    pub fn custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }

    /// Collect `git rev-parse`/`git branch` output through the executor, the
    /// whitelisted-prefix environment variables, and the current UTC time.
    pub async fn build(self, executor: &CommandExecutor, work_dir: &std::path::Path) -> VariableNamespace {
        let git = Self::collect_git(executor, work_dir).await;
        let environment = Self::collect_environment();
        let now: DateTime<Utc> = Utc::now();

        VariableNamespace {
            session: self.session.unwrap_or(Value::Null),
            project: self.project.unwrap_or(Value::Null),
            git,
            user: serde_json::json!({
                "name": whoami_fallback(),
            }),
            environment,
            timestamp: serde_json::json!({
                "utc": now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                "unix": now.timestamp(),
            }),
            custom: Value::Object(self.custom.into_iter().collect()),
        }
    }

    async fn collect_git(executor: &CommandExecutor, work_dir: &std::path::Path) -> Value {
        let opts = ExecOptions {
            working_directory: Some(work_dir.to_path_buf()),
            ..Default::default()
        };
        let branch = executor
            .execute(
                &["git".into(), "rev-parse".into(), "--abbrev-ref".into(), "HEAD".into()],
                opts.clone(),
            )
            .await
            .ok()
            .filter(|r| r.success)
            .map(|r| String::from_utf8_lossy(&r.stdout).trim().to_string());

        let sha = executor
            .execute(&["git".into(), "rev-parse".into(), "HEAD".into()], opts)
            .await
            .ok()
            .filter(|r| r.success)
            .map(|r| String::from_utf8_lossy(&r.stdout).trim().to_string());

        serde_json::json!({
            "branch": branch,
            "sha": sha,
        })
    }

    fn collect_environment() -> Value {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_WHITELIST_PREFIX))
            .map(|(k, v)| (k.trim_start_matches(ENV_WHITELIST_PREFIX).to_string(), v))
            .collect();
        serde_json::to_value(vars).unwrap_or(Value::Null)
    }
}

fn whoami_fallback() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
